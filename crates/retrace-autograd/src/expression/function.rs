//! Named element-wise functions paired with their derivatives.

use retrace_core::{BinaryFunction, UnaryFunction};
use smallvec::SmallVec;

use crate::expression::{
    accumulate, argument, result_gradient, store_result, BinaryOperands, Expression, ExpressionId, UnaryOperands,
};
use crate::node::{NodeArena, NodeId};
use crate::Result;

/// `R = f(A)` for an activation or other unary function.
#[derive(Debug)]
pub struct UnaryFunctionExpression {
    id: ExpressionId,
    operands: UnaryOperands,
    function: UnaryFunction,
}

impl UnaryFunctionExpression {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, function: UnaryFunction) -> Self {
        Self { id, operands, function }
    }
}

impl Expression for UnaryFunctionExpression {
    fn id(&self) -> ExpressionId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn arguments(&self) -> SmallVec<[NodeId; 2]> {
        self.operands.arguments()
    }

    fn result(&self) -> NodeId {
        self.operands.result
    }

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, self.function.apply(&a))
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        let r = argument(nodes, self.operands.result, index, self.name())?;
        let delta = self.function.gradient(&a, &r, &gradient)?;
        accumulate(nodes, self.operands.argument, index, &delta, true)
    }

    fn gradient_rule(&self) -> &'static str {
        match self.function {
            UnaryFunction::Softmax => "dA += J(R)ᵗ · dR",
            _ => "dA += f'(A) ⊙ dR",
        }
    }
}

/// `R = f(A, B)`; only `A` receives a gradient.
#[derive(Debug)]
pub struct BinaryFunctionExpression {
    id: ExpressionId,
    operands: BinaryOperands,
    function: BinaryFunction,
}

impl BinaryFunctionExpression {
    pub(crate) fn new(id: ExpressionId, operands: BinaryOperands, function: BinaryFunction) -> Self {
        Self { id, operands, function }
    }
}

impl Expression for BinaryFunctionExpression {
    fn id(&self) -> ExpressionId {
        self.id
    }

    fn name(&self) -> &'static str {
        self.function.name()
    }

    fn arguments(&self) -> SmallVec<[NodeId; 2]> {
        self.operands.arguments()
    }

    fn result(&self) -> NodeId {
        self.operands.result
    }

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, self.function.apply(&a, &b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        let delta = self.function.gradient(&a, &b, &gradient)?;
        accumulate(nodes, self.operands.argument1, index, &delta, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += ∂f/∂A(A, B) ⊙ dR"
    }
}
