//! Graph state: per-sample values and accumulated gradients.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use retrace_core::{Matrix, Shape};

use crate::error::AutogradError;
use crate::Result;

/// Stable handle of a node inside one procedure's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// How a node stores values across sample indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// One value per sample index.
    MultiIndex,
    /// One value shared by every index, computed by an aggregate expression.
    Shared,
    /// One value shared by every index, owned by the caller (parameters,
    /// weights, literals). The value is the caller's matrix handle itself.
    Constant,
}

/// One logical matrix across a sample index space.
///
/// Values are written only by the forward chain; gradients accumulate until
/// [`Node::reset`]. A node whose prototype is scalar reduces every incoming
/// gradient to its sum before accumulating.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    reference: Matrix,
    stop_gradient: bool,
    values: BTreeMap<usize, Matrix>,
    shared_value: Option<Matrix>,
    gradients: BTreeMap<usize, Matrix>,
    shared_gradient: Option<Matrix>,
    contributors: BTreeSet<usize>,
    from: Option<NodeId>,
    to: Option<NodeId>,
    backups: HashMap<usize, BTreeMap<usize, Matrix>>,
}

impl Node {
    fn new(id: NodeId, reference: &Matrix, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            shared_value: (kind == NodeKind::Constant).then(|| reference.clone()),
            reference: reference.clone(),
            stop_gradient: false,
            values: BTreeMap::new(),
            gradients: BTreeMap::new(),
            shared_gradient: None,
            contributors: BTreeSet::new(),
            from: None,
            to: None,
            backups: HashMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Prototype matrix the node was created from.
    pub fn reference(&self) -> &Matrix {
        &self.reference
    }

    pub fn shape(&self) -> Shape {
        self.reference.shape()
    }

    pub fn is_multi_index(&self) -> bool {
        self.kind == NodeKind::MultiIndex
    }

    pub fn is_constant(&self) -> bool {
        self.kind == NodeKind::Constant
    }

    pub fn is_stop_gradient(&self) -> bool {
        self.stop_gradient
    }

    /// Make every later gradient accumulation a no-op. Idempotent.
    pub fn mark_stop_gradient(&mut self) {
        self.stop_gradient = true;
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn value(&self, index: usize) -> Option<&Matrix> {
        match self.kind {
            NodeKind::MultiIndex => self.values.get(&index),
            NodeKind::Shared | NodeKind::Constant => self.shared_value.as_ref(),
        }
    }

    /// Value at `index`, or a zero matrix of the node's shape when none is set.
    pub fn value_or_empty(&self, index: usize) -> Matrix {
        self.value(index)
            .cloned()
            .unwrap_or_else(|| self.reference.zeros_like())
    }

    /// Store a value. Constant nodes keep the caller's matrix and ignore this.
    pub fn set_value(&mut self, index: usize, value: Matrix) {
        match self.kind {
            NodeKind::MultiIndex => {
                self.values.insert(index, value);
            }
            NodeKind::Shared => self.shared_value = Some(value),
            NodeKind::Constant => {}
        }
    }

    /// Sample indices holding a value, ascending.
    pub fn indices(&self) -> Vec<usize> {
        self.values.keys().copied().collect()
    }

    // =========================================================================
    // Gradients
    // =========================================================================

    /// Gradient at `index`. Constants keep one gradient per contributing
    /// index so the mean is summed in a fixed order.
    pub fn gradient(&self, index: usize) -> Option<&Matrix> {
        match self.kind {
            NodeKind::MultiIndex | NodeKind::Constant => self.gradients.get(&index),
            NodeKind::Shared => self.shared_gradient.as_ref(),
        }
    }

    /// Gradient at `index`, or a zero matrix of the node's shape when none is set.
    pub fn gradient_or_empty(&self, index: usize) -> Matrix {
        self.gradient(index)
            .cloned()
            .unwrap_or_else(|| self.reference.zeros_like())
    }

    /// Overwrite the gradient at `index`.
    pub fn set_gradient(&mut self, index: usize, gradient: Matrix) {
        match self.kind {
            NodeKind::MultiIndex | NodeKind::Constant => {
                self.gradients.insert(index, gradient);
            }
            NodeKind::Shared => self.shared_gradient = Some(gradient),
        }
    }

    /// Add (`add == true`) or subtract `delta` into the gradient at `index`.
    ///
    /// A scalar prototype first reduces `delta` to its sum. Stop-gradient
    /// nodes ignore the call.
    pub fn accumulate_gradient(&mut self, index: usize, delta: &Matrix, add: bool) -> Result<()> {
        if self.stop_gradient {
            return Ok(());
        }
        let delta = if self.reference.is_scalar() && !delta.is_scalar() {
            delta.sum()
        } else {
            delta.clone()
        };
        let current = self.gradient_or_empty(index);
        let updated = if add {
            current.add(&delta)?
        } else {
            current.sub(&delta)?
        };
        if updated.shape() != self.shape() {
            return Err(AutogradError::Matrix(retrace_core::MatrixError::ShapeMismatch {
                op: "accumulate_gradient",
                left: self.shape(),
                right: updated.shape(),
            }));
        }
        self.contributors.insert(index);
        self.set_gradient(index, updated);
        Ok(())
    }

    /// Make sure a gradient exists at `index`, inserting zeros when absent.
    pub fn ensure_gradient(&mut self, index: usize) {
        if self.gradient(index).is_none() {
            let zeros = self.reference.zeros_like();
            self.set_gradient(index, zeros);
        }
    }

    /// Number of distinct sample indices that accumulated into this node.
    pub fn entry_count(&self) -> usize {
        self.contributors.len()
    }

    /// Gradient averaged over the sample indices that contributed to it, or
    /// zeros when nothing contributed.
    pub fn gradient_mean(&self) -> Result<Matrix> {
        let count = self.entry_count();
        if count == 0 {
            return Ok(self.reference.zeros_like());
        }
        let total = match self.kind {
            NodeKind::MultiIndex | NodeKind::Constant => {
                let gradients: Vec<Matrix> = self.gradients.values().cloned().collect();
                Matrix::sum_of(&gradients)?
            }
            NodeKind::Shared => self.gradient_or_empty(0),
        };
        Ok(total.mul_scalar(1.0 / count as f64))
    }

    // =========================================================================
    // Cross-step links
    // =========================================================================

    /// Result node of the step before whose value feeds this node.
    pub fn from(&self) -> Option<NodeId> {
        self.from
    }

    /// Argument node of the next step that reads this node's value.
    pub fn to(&self) -> Option<NodeId> {
        self.to
    }

    /// Whether the node takes part in a cross-step dependency.
    pub fn is_dependent(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    pub(crate) fn link_from(&mut self, from: NodeId) {
        self.from = Some(from);
    }

    pub(crate) fn link_to(&mut self, to: NodeId) {
        self.to = Some(to);
    }

    /// Snapshot all values under `backup` when the node feeds a later step.
    pub fn store_dependency(&mut self, backup: usize) {
        if self.to.is_none() {
            return;
        }
        self.backups.insert(backup, self.values.clone());
    }

    /// Put back the values stored under `backup`, if any.
    pub fn restore_dependency(&mut self, backup: usize) {
        if self.to.is_none() {
            return;
        }
        if let Some(stored) = self.backups.get(&backup) {
            self.values
                .extend(stored.iter().map(|(index, value)| (*index, value.clone())));
        }
    }

    /// Clear per-sample state.
    ///
    /// Values of a node feeding a later step survive when `keep_dependent` is
    /// set, so the next unroll can read them. Constant values always survive.
    /// Gradients, contributor counts and backups are always cleared.
    pub fn reset(&mut self, keep_dependent: bool) {
        match self.kind {
            NodeKind::MultiIndex => {
                if self.to.is_none() || !keep_dependent {
                    self.values.clear();
                }
            }
            NodeKind::Shared => self.shared_value = None,
            NodeKind::Constant => {}
        }
        self.gradients.clear();
        self.shared_gradient = None;
        self.contributors.clear();
        self.backups.clear();
    }
}

/// Owning store of every node of one traced generation.
#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a node modelled on `reference`.
    pub fn push(&mut self, reference: &Matrix, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, reference, kind));
        id
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(AutogradError::NoSuchNode(id))
    }

    pub fn get_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.0).ok_or(AutogradError::NoSuchNode(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    /// Link `from` (a result of one step) to `to` (an argument of the next).
    pub fn link(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        let (from_shape, to_shape) = (self.get(from)?.shape(), self.get(to)?.shape());
        if from_shape != to_shape {
            return Err(AutogradError::DependencyShapeMismatch {
                from,
                to,
                from_shape,
                to_shape,
            });
        }
        self.get_mut(from)?.link_to(to);
        self.get_mut(to)?.link_from(from);
        Ok(())
    }

    /// Pull the value of a linked predecessor into `id` at `index`.
    ///
    /// `previous` is the sample index processed before `index`; with no
    /// previous index, or no value there, the node reads zeros.
    pub fn update_value_dependency(&mut self, id: NodeId, index: usize, previous: Option<usize>) -> Result<()> {
        let Some(from) = self.get(id)?.from() else {
            return Ok(());
        };
        let value = previous
            .and_then(|p| self.nodes.get(from.0).and_then(|n| n.value(p).cloned()))
            .unwrap_or_else(|| self.nodes[id.0].reference.zeros_like());
        self.get_mut(id)?.set_value(index, value);
        Ok(())
    }

    /// Add the gradient of a linked successor into `id` at `index`.
    ///
    /// `next` is the sample index that follows `index` in the forward walk.
    /// The gradient slot is created even when nothing flows back, so the
    /// producing expression can always run.
    pub fn update_gradient_dependency(&mut self, id: NodeId, index: usize, next: Option<usize>) -> Result<()> {
        let Some(to) = self.get(id)?.to() else {
            return Ok(());
        };
        let incoming = next.and_then(|n| self.nodes.get(to.0).and_then(|node| node.gradient(n).cloned()));
        let node = self.get_mut(id)?;
        match incoming {
            Some(gradient) => node.accumulate_gradient(index, &gradient, true)?,
            None => node.ensure_gradient(index),
        }
        Ok(())
    }
}
