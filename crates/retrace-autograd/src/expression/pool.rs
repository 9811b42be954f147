//! Pooling expressions.
//!
//! Max, cyclic and random pooling record which input cell every output cell
//! read from; backward routes the gradient through those positions only.

use std::collections::HashMap;

use rand::rngs::StdRng;
use retrace_core::{Matrix, PoolParams, PoolPositions};

use crate::error::AutogradError;
use crate::expression::{
    accumulate, argument, result_gradient, store_result, Expression, ExpressionId,
    UnaryOperands,
};
use crate::node::NodeArena;
use crate::Result;

/// Backward through recorded positions, shared by the positional pools.
fn route_gradient(
    nodes: &mut NodeArena,
    operands: UnaryOperands,
    positions: &HashMap<usize, PoolPositions>,
    index: usize,
    expression: &'static str,
) -> Result<()> {
    let gradient = result_gradient(nodes, operands.result, index, expression)?;
    let positions = positions
        .get(&index)
        .ok_or(AutogradError::MissingPoolPositions { expression, index })?;
    let delta = Matrix::positional_pool_gradient(&gradient, positions)?;
    accumulate(nodes, operands.argument, index, &delta, true)
}

/// Maximum of each window.
#[derive(Debug)]
pub struct MaxPool {
    id: ExpressionId,
    operands: UnaryOperands,
    params: PoolParams,
    positions: HashMap<usize, PoolPositions>,
}

impl MaxPool {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, params: PoolParams) -> Self {
        Self {
            id,
            operands,
            params,
            positions: HashMap::new(),
        }
    }
}

impl Expression for MaxPool {
    expression_header!("MAX_POOL");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        let (value, positions) = a.max_pool(self.params)?;
        self.positions.insert(index, positions);
        store_result(nodes, self.operands.result, index, value)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        route_gradient(nodes, self.operands, &self.positions, index, self.name())
    }

    fn reset(&mut self) {
        self.positions.clear();
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR routed to the maximum of each window"
    }
}

/// One window cell per output cell, cycling through window offsets row-major.
#[derive(Debug)]
pub struct CyclicPool {
    id: ExpressionId,
    operands: UnaryOperands,
    params: PoolParams,
    cursor: usize,
    positions: HashMap<usize, PoolPositions>,
}

impl CyclicPool {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, params: PoolParams) -> Self {
        Self {
            id,
            operands,
            params,
            cursor: 0,
            positions: HashMap::new(),
        }
    }
}

impl Expression for CyclicPool {
    expression_header!("CYCLIC_POOL");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        let (value, positions) = a.cyclic_pool(self.params, &mut self.cursor)?;
        self.positions.insert(index, positions);
        store_result(nodes, self.operands.result, index, value)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        route_gradient(nodes, self.operands, &self.positions, index, self.name())
    }

    fn reset(&mut self) {
        self.positions.clear();
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR routed to the cyclically chosen cell of each window"
    }
}

/// One uniformly random window cell per output cell.
#[derive(Debug)]
pub struct RandomPool {
    id: ExpressionId,
    operands: UnaryOperands,
    params: PoolParams,
    rng: StdRng,
    positions: HashMap<usize, PoolPositions>,
}

impl RandomPool {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, params: PoolParams, rng: StdRng) -> Self {
        Self {
            id,
            operands,
            params,
            rng,
            positions: HashMap::new(),
        }
    }
}

impl Expression for RandomPool {
    expression_header!("RANDOM_POOL");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        let (value, positions) = a.random_pool(self.params, &mut self.rng)?;
        self.positions.insert(index, positions);
        store_result(nodes, self.operands.result, index, value)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        route_gradient(nodes, self.operands, &self.positions, index, self.name())
    }

    fn reset(&mut self) {
        self.positions.clear();
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR routed to the randomly chosen cell of each window"
    }
}

/// Mean of each window.
#[derive(Debug)]
pub struct AveragePool {
    id: ExpressionId,
    operands: UnaryOperands,
    params: PoolParams,
}

impl AveragePool {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, params: PoolParams) -> Self {
        Self { id, operands, params }
    }
}

impl Expression for AveragePool {
    expression_header!("AVERAGE_POOL");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.average_pool(self.params)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let input_shape = nodes.get(self.operands.argument)?.shape();
        let delta = Matrix::average_pool_gradient(&gradient, input_shape, self.params)?;
        accumulate(nodes, self.operands.argument, index, &delta, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR / (rows · columns) over each window"
    }
}
