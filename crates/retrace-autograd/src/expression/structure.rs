//! Join, unjoin and flatten.

use retrace_core::ops::manipulation::join_offset;
use retrace_core::{JoinAxis, Matrix, Shape};

use crate::expression::{
    accumulate, argument, result_gradient, store_result, BinaryOperands, Expression,
    ExpressionId, UnaryOperands,
};
use crate::node::NodeArena;
use crate::Result;

/// `R = [A; B]` along an axis.
#[derive(Debug)]
pub struct Join {
    id: ExpressionId,
    operands: BinaryOperands,
    axis: JoinAxis,
}

impl Join {
    pub(crate) fn new(id: ExpressionId, operands: BinaryOperands, axis: JoinAxis) -> Self {
        Self { id, operands, axis }
    }
}

impl Expression for Join {
    expression_header!("JOIN");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.join(&b, self.axis)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a_shape = nodes.get(self.operands.argument1)?.shape();
        let b_shape = nodes.get(self.operands.argument2)?.shape();
        let a_gradient = gradient.unjoin((0, 0, 0), a_shape)?;
        let b_gradient = gradient.unjoin(join_offset(a_shape, self.axis), b_shape)?;
        accumulate(nodes, self.operands.argument1, index, &a_gradient, true)?;
        accumulate(nodes, self.operands.argument2, index, &b_gradient, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += unjoin(dR, A), dB += unjoin(dR, B)"
    }
}

/// `R` is the block of `shape` at `at` inside `A`.
#[derive(Debug)]
pub struct Unjoin {
    id: ExpressionId,
    operands: UnaryOperands,
    at: (usize, usize, usize),
    shape: Shape,
}

impl Unjoin {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, at: (usize, usize, usize), shape: Shape) -> Self {
        Self {
            id,
            operands,
            at,
            shape,
        }
    }
}

impl Expression for Unjoin {
    expression_header!("UNJOIN");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.unjoin(self.at, self.shape)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a_shape = nodes.get(self.operands.argument)?.shape();
        let delta = Matrix::embed(&gradient, self.at, a_shape)?;
        accumulate(nodes, self.operands.argument, index, &delta, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR placed at the unjoined block"
    }
}

/// `R` is `A` as one column in storage order.
#[derive(Debug)]
pub struct Flatten {
    id: ExpressionId,
    operands: UnaryOperands,
}

impl Flatten {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands) -> Self {
        Self { id, operands }
    }
}

impl Expression for Flatten {
    expression_header!("FLATTEN");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.flatten())
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a_shape = nodes.get(self.operands.argument)?.shape();
        accumulate(nodes, self.operands.argument, index, &gradient.reshape(a_shape)?, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += reshape(dR, A)"
    }
}
