//! Dropout and gradient clipping.

use std::collections::HashMap;

use rand::rngs::StdRng;
use retrace_core::Matrix;

use crate::expression::{
    accumulate, argument, result_gradient, store_result, Expression, ExpressionId,
    UnaryOperands,
};
use crate::node::NodeArena;
use crate::Result;

/// Inverted dropout. Each cell is dropped with `probability` and kept cells
/// are scaled by `1 / (1 - probability)`.
///
/// Active while training, or always when `monte_carlo` is set. The mask
/// sampled at an index is reapplied to the gradient at that index.
#[derive(Debug)]
pub struct Dropout {
    id: ExpressionId,
    operands: UnaryOperands,
    probability: f64,
    monte_carlo: bool,
    training: bool,
    rng: StdRng,
    masks: HashMap<usize, Matrix>,
}

impl Dropout {
    pub(crate) fn new(
        id: ExpressionId,
        operands: UnaryOperands,
        probability: f64,
        monte_carlo: bool,
        rng: StdRng,
    ) -> Self {
        Self {
            id,
            operands,
            probability,
            monte_carlo,
            training: false,
            rng,
            masks: HashMap::new(),
        }
    }

    fn is_active(&self) -> bool {
        self.training || self.monte_carlo
    }
}

impl Expression for Dropout {
    expression_header!("DROPOUT");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        let value = if self.is_active() {
            let mask = Matrix::dropout_mask(a.shape(), self.probability, &mut self.rng)?;
            let dropped = a.mul(&mask)?;
            self.masks.insert(index, mask);
            dropped
        } else {
            self.masks.remove(&index);
            a.deep_copy()
        };
        store_result(nodes, self.operands.result, index, value)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let delta = match self.masks.get(&index) {
            Some(mask) => gradient.mul(mask)?,
            None => gradient,
        };
        accumulate(nodes, self.operands.argument, index, &delta, true)
    }

    fn reset(&mut self) {
        self.masks.clear();
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += dR ⊙ mask"
    }
}

/// Identity forward; backward clamps each gradient cell to `[-threshold, threshold]`.
#[derive(Debug)]
pub struct GradientClipping {
    id: ExpressionId,
    operands: UnaryOperands,
    threshold: f64,
}

impl GradientClipping {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, threshold: f64) -> Self {
        Self {
            id,
            operands,
            threshold,
        }
    }
}

impl Expression for GradientClipping {
    expression_header!("GRADIENT_CLIPPING");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let a = argument(nodes, self.operands.argument, index, self.name())?;
        store_result(nodes, self.operands.result, index, a.deep_copy())
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        accumulate(nodes, self.operands.argument, index, &gradient.clip(self.threshold)?, true)
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += clip(dR, threshold)"
    }
}
