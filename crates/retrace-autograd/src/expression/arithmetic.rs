//! Element-wise arithmetic, dot product and transpose.

use crate::expression::{
    accumulate, argument, result_gradient, store_result, wants_gradient, BinaryOperands,
    Expression, ExpressionId, UnaryOperands,
};
use crate::node::NodeArena;
use crate::Result;

macro_rules! binary_expression {
    ($(#[$doc:meta])* $ty:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $ty {
            id: ExpressionId,
            operands: BinaryOperands,
        }

        impl $ty {
            pub(crate) fn new(id: ExpressionId, operands: BinaryOperands) -> Self {
                Self { id, operands }
            }
        }
    };
}

binary_expression!(
    /// `R = A + B`.
    Add
);
binary_expression!(
    /// `R = A - B`.
    Subtract
);
binary_expression!(
    /// `R = A ⊙ B`.
    Multiply
);
binary_expression!(
    /// `R = A / B`, element-wise.
    Divide
);
binary_expression!(
    /// `R = A · B`, per depth slice.
    Dot
);

impl Expression for Add {
    expression_header!("ADD");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.add(&b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        accumulate(nodes, self.operands.argument1, index, &gradient, true)?;
        accumulate(nodes, self.operands.argument2, index, &gradient, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR, dB += dR"
    }
}

impl Expression for Subtract {
    expression_header!("SUB");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.sub(&b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        accumulate(nodes, self.operands.argument1, index, &gradient, true)?;
        accumulate(nodes, self.operands.argument2, index, &gradient, false)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR, dB -= dR"
    }
}

impl Expression for Multiply {
    expression_header!("MUL");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.mul(&b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        accumulate(nodes, self.operands.argument1, index, &gradient.mul(&b)?, true)?;
        accumulate(nodes, self.operands.argument2, index, &gradient.mul(&a)?, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR ⊙ B, dB += dR ⊙ A"
    }
}

impl Expression for Divide {
    expression_header!("DIV");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.div(&b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        accumulate(nodes, self.operands.argument1, index, &gradient.div(&b)?, true)?;
        let b_gradient = gradient.mul(&a)?.div(&b.mul(&b)?)?;
        accumulate(nodes, self.operands.argument2, index, &b_gradient, false)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR / B, dB -= dR ⊙ A / B²"
    }
}

impl Expression for Dot {
    expression_header!("DOT");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument1, index, self.name())?;
        let b = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.dot(&b)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        if wants_gradient(nodes, self.operands.argument1)? {
            let b = argument(nodes, self.operands.argument2, index, self.name())?;
            accumulate(nodes, self.operands.argument1, index, &gradient.dot(&b.transpose())?, true)?;
        }
        if wants_gradient(nodes, self.operands.argument2)? {
            let a = argument(nodes, self.operands.argument1, index, self.name())?;
            accumulate(nodes, self.operands.argument2, index, &a.transpose().dot(&gradient)?, true)?;
        }
        Ok(())
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR · Bᵗ, dB += Aᵗ · dR"
    }
}

/// `R = Aᵗ`, per depth slice.
#[derive(Debug)]
pub struct Transpose {
    id: ExpressionId,
    operands: UnaryOperands,
}

impl Transpose {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands) -> Self {
        Self { id, operands }
    }
}

impl Expression for Transpose {
    expression_header!("TRANSPOSE");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.transpose())
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        accumulate(nodes, self.operands.argument, index, &gradient.transpose(), true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dRᵗ"
    }
}
