//! Convolution and cross-correlation with stride and dilation.

use retrace_core::{ConvolutionParams, Matrix};

use crate::expression::{
    accumulate, argument, result_gradient, store_result, wants_gradient, BinaryOperands,
    Expression, ExpressionId,
};
use crate::node::NodeArena;
use crate::Result;

/// `R = A * B` with the filter `B` flipped in both spatial axes.
#[derive(Debug)]
pub struct Convolve {
    id: ExpressionId,
    operands: BinaryOperands,
    params: ConvolutionParams,
}

impl Convolve {
    pub(crate) fn new(id: ExpressionId, operands: BinaryOperands, params: ConvolutionParams) -> Self {
        Self { id, operands, params }
    }
}

impl Expression for Convolve {
    expression_header!("CONVOLVE");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let input = argument(nodes, self.operands.argument1, index, self.name())?;
        let filter = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, input.convolve(&filter, self.params)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let input = argument(nodes, self.operands.argument1, index, self.name())?;
        let filter = argument(nodes, self.operands.argument2, index, self.name())?;
        if wants_gradient(nodes, self.operands.argument1)? {
            let delta = Matrix::convolve_input_gradient(&gradient, &filter, input.shape(), self.params)?;
            accumulate(nodes, self.operands.argument1, index, &delta, true)?;
        }
        if wants_gradient(nodes, self.operands.argument2)? {
            let delta = Matrix::convolve_filter_gradient(&gradient, &input, filter.shape(), self.params)?;
            accumulate(nodes, self.operands.argument2, index, &delta, true)?;
        }
        Ok(())
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += full_crosscorrelate(dR, B), dB += crosscorrelate(A, dR) flipped"
    }
}

/// `R = A ⋆ B`, the filter applied without flipping.
#[derive(Debug)]
pub struct Crosscorrelate {
    id: ExpressionId,
    operands: BinaryOperands,
    params: ConvolutionParams,
}

impl Crosscorrelate {
    pub(crate) fn new(id: ExpressionId, operands: BinaryOperands, params: ConvolutionParams) -> Self {
        Self { id, operands, params }
    }
}

impl Expression for Crosscorrelate {
    expression_header!("CROSSCORRELATE");

    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let input = argument(nodes, self.operands.argument1, index, self.name())?;
        let filter = argument(nodes, self.operands.argument2, index, self.name())?;
        store_result(nodes, self.operands.result, index, input.crosscorrelate(&filter, self.params)?)
    }

    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
        let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
        let input = argument(nodes, self.operands.argument1, index, self.name())?;
        let filter = argument(nodes, self.operands.argument2, index, self.name())?;
        if wants_gradient(nodes, self.operands.argument1)? {
            let delta = Matrix::crosscorrelate_input_gradient(&gradient, &filter, input.shape(), self.params)?;
            accumulate(nodes, self.operands.argument1, index, &delta, true)?;
        }
        if wants_gradient(nodes, self.operands.argument2)? {
            let delta = Matrix::crosscorrelate_filter_gradient(&gradient, &input, filter.shape(), self.params)?;
            accumulate(nodes, self.operands.argument2, index, &delta, true)?;
        }
        Ok(())
    }

    fn gradient_rule(&self) -> &'static str {
        "dA += full_convolve(dR, B), dB += crosscorrelate(A, dR)"
    }
}
