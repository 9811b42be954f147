//! Identity-keyed node registry for one trace.

use std::collections::HashMap;

use retrace_core::{Matrix, MatrixId};

use crate::expression::ExpressionId;
use crate::node::{NodeArena, NodeId, NodeKind};
use crate::Result;

/// Where a node was first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOrigin {
    /// Trace that created the node.
    pub trace: usize,
    /// Expression that produced the node, or `None` for inputs and constants.
    pub expression: Option<ExpressionId>,
}

/// Deduplicates node creation per matrix allocation within one trace.
///
/// The same allocation always maps to the same node; a deep copy is a
/// different allocation and gets its own node.
#[derive(Debug)]
pub struct NodeRegister {
    trace: usize,
    arena: NodeArena,
    by_matrix: HashMap<MatrixId, NodeId>,
    origins: Vec<NodeOrigin>,
}

impl NodeRegister {
    pub fn new(trace: usize) -> Self {
        Self {
            trace,
            arena: NodeArena::new(),
            by_matrix: HashMap::new(),
            origins: Vec::new(),
        }
    }

    pub fn trace(&self) -> usize {
        self.trace
    }

    /// Node of `matrix`, allocating one of `kind` when the allocation is new.
    ///
    /// `expression` records the producing expression of a freshly created
    /// result node. An existing node is returned unchanged.
    pub fn define(&mut self, matrix: &Matrix, kind: NodeKind, expression: Option<ExpressionId>) -> NodeId {
        if let Some(&id) = self.by_matrix.get(&matrix.id()) {
            return id;
        }
        let id = self.arena.push(matrix, kind);
        self.by_matrix.insert(matrix.id(), id);
        self.origins.push(NodeOrigin {
            trace: self.trace,
            expression,
        });
        id
    }

    /// Whether `matrix` has been traced.
    pub fn node_exists(&self, matrix: &Matrix) -> bool {
        self.by_matrix.contains_key(&matrix.id())
    }

    /// Whether `node` belongs to this register.
    pub fn contains(&self, node: NodeId) -> bool {
        node.index() < self.arena.len()
    }

    pub fn node_of(&self, matrix: &Matrix) -> Option<NodeId> {
        self.by_matrix.get(&matrix.id()).copied()
    }

    pub fn origin(&self, node: NodeId) -> Option<NodeOrigin> {
        self.origins.get(node.index()).copied()
    }

    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut NodeArena {
        &mut self.arena
    }

    /// Mark the node of `matrix` as stop-gradient, if traced.
    pub fn mark_stop_gradient(&mut self, matrix: &Matrix) -> Result<()> {
        if let Some(id) = self.node_of(matrix) {
            self.arena.get_mut(id)?.mark_stop_gradient();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Finish tracing: hand over the nodes and forget the matrix identities,
    /// so later operations on the same matrices are no longer attributed to
    /// this graph.
    pub fn detach(self) -> NodeArena {
        self.arena
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_deduplicates_by_allocation() {
        let mut register = NodeRegister::new(1);
        let a = Matrix::zeros((2, 2));
        let alias = a.clone();
        let copy = a.deep_copy();

        let first = register.define(&a, NodeKind::MultiIndex, None);
        let second = register.define(&alias, NodeKind::Constant, None);
        let third = register.define(&copy, NodeKind::MultiIndex, None);

        assert_eq!(first, second);
        assert_ne!(first, third);
        assert_eq!(register.len(), 2);
        assert_eq!(register.arena().get(first).unwrap().kind(), NodeKind::MultiIndex);
    }

    #[test]
    fn test_origin_and_queries() {
        let mut register = NodeRegister::new(0);
        let a = Matrix::zeros((1, 1));
        let r = Matrix::zeros((1, 1));
        let input = register.define(&a, NodeKind::MultiIndex, None);
        let result = register.define(&r, NodeKind::MultiIndex, Some(ExpressionId::new(4)));

        assert!(register.node_exists(&a));
        assert!(!register.node_exists(&Matrix::zeros((1, 1))));
        assert!(register.contains(result));
        assert_eq!(register.origin(input).unwrap().expression, None);
        assert_eq!(
            register.origin(result),
            Some(NodeOrigin {
                trace: 0,
                expression: Some(ExpressionId::new(4)),
            })
        );
    }

    #[test]
    fn test_stop_gradient_marking() {
        let mut register = NodeRegister::new(0);
        let a = Matrix::zeros((1, 1));
        let id = register.define(&a, NodeKind::Constant, None);
        register.mark_stop_gradient(&a).unwrap();
        register.mark_stop_gradient(&Matrix::zeros((1, 1))).unwrap();
        let arena = register.detach();
        assert!(arena.get(id).unwrap().is_stop_gradient());
    }
}
