//! Convolution and cross-correlation with stride and dilation.
//!
//! Output extent per axis: `(n - (f - 1) * dilation - 1) / stride + 1`.
//! A filter of depth 1 is shared across every input depth slice, otherwise the
//! filter depth must match the input depth and slices pair up one to one.
//! Convolution reads the filter flipped in both spatial axes.

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::shape::Shape;
use crate::Result;

/// Stride and dilation of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvolutionParams {
    pub stride: usize,
    pub dilation: usize,
}

impl Default for ConvolutionParams {
    fn default() -> Self {
        Self {
            stride: 1,
            dilation: 1,
        }
    }
}

impl ConvolutionParams {
    pub fn new(stride: usize, dilation: usize) -> Self {
        Self { stride, dilation }
    }

    /// Output shape for `input` filtered by a filter of `filter` shape.
    pub fn output_shape(&self, input: Shape, filter: Shape) -> Result<Shape> {
        if filter.depth() != 1 && filter.depth() != input.depth() {
            return Err(MatrixError::Filter { filter, input });
        }
        let rows = output_extent(input.rows(), filter.rows(), self.stride, self.dilation)
            .ok_or(MatrixError::Filter { filter, input })?;
        let columns = output_extent(input.columns(), filter.columns(), self.stride, self.dilation)
            .ok_or(MatrixError::Filter { filter, input })?;
        Ok(Shape::new_3d(rows, columns, input.depth()))
    }

    fn validate(&self) -> Result<()> {
        if self.stride == 0 || self.dilation == 0 {
            return Err(MatrixError::InvalidParameter(format!(
                "stride and dilation must be positive, got stride={} dilation={}",
                self.stride, self.dilation
            )));
        }
        Ok(())
    }
}

/// Number of window positions along one axis, `None` when the window does not fit.
pub(crate) fn output_extent(n: usize, f: usize, stride: usize, dilation: usize) -> Option<usize> {
    if f == 0 || stride == 0 || dilation == 0 {
        return None;
    }
    let span = (f - 1) * dilation + 1;
    if span > n {
        return None;
    }
    Some((n - span) / stride + 1)
}

impl Matrix {
    /// Cross-correlate `self` with `filter`.
    pub fn crosscorrelate(&self, filter: &Matrix, params: ConvolutionParams) -> Result<Matrix> {
        correlate(self, filter, params, false)
    }

    /// Convolve `self` with `filter` (filter flipped in both spatial axes).
    pub fn convolve(&self, filter: &Matrix, params: ConvolutionParams) -> Result<Matrix> {
        correlate(self, filter, params, true)
    }

    /// Gradient of a cross-correlation with respect to its input.
    pub fn crosscorrelate_input_gradient(
        output_gradient: &Matrix,
        filter: &Matrix,
        input_shape: Shape,
        params: ConvolutionParams,
    ) -> Result<Matrix> {
        input_gradient(output_gradient, filter, input_shape, params, false)
    }

    /// Gradient of a cross-correlation with respect to its filter.
    pub fn crosscorrelate_filter_gradient(
        output_gradient: &Matrix,
        input: &Matrix,
        filter_shape: Shape,
        params: ConvolutionParams,
    ) -> Result<Matrix> {
        filter_gradient(output_gradient, input, filter_shape, params, false)
    }

    /// Gradient of a convolution with respect to its input.
    pub fn convolve_input_gradient(
        output_gradient: &Matrix,
        filter: &Matrix,
        input_shape: Shape,
        params: ConvolutionParams,
    ) -> Result<Matrix> {
        input_gradient(output_gradient, filter, input_shape, params, true)
    }

    /// Gradient of a convolution with respect to its filter.
    pub fn convolve_filter_gradient(
        output_gradient: &Matrix,
        input: &Matrix,
        filter_shape: Shape,
        params: ConvolutionParams,
    ) -> Result<Matrix> {
        filter_gradient(output_gradient, input, filter_shape, params, true)
    }
}

/// Visit every (output cell, filter cell) pair with the matching input offset.
fn for_each_tap(
    input: Shape,
    filter: Shape,
    output: Shape,
    params: ConvolutionParams,
    flip: bool,
    mut visit: impl FnMut(usize, usize, usize),
) {
    for d in 0..output.depth() {
        let fd = if filter.depth() == 1 { 0 } else { d };
        for i in 0..output.rows() {
            for j in 0..output.columns() {
                let out_offset = output.offset(i, j, d);
                for fr in 0..filter.rows() {
                    for fc in 0..filter.columns() {
                        let row = i * params.stride + fr * params.dilation;
                        let column = j * params.stride + fc * params.dilation;
                        let (tr, tc) = if flip {
                            (filter.rows() - 1 - fr, filter.columns() - 1 - fc)
                        } else {
                            (fr, fc)
                        };
                        visit(
                            out_offset,
                            input.offset(row, column, d),
                            filter.offset(tr, tc, fd),
                        );
                    }
                }
            }
        }
    }
}

fn correlate(input: &Matrix, filter: &Matrix, params: ConvolutionParams, flip: bool) -> Result<Matrix> {
    params.validate()?;
    let output = params.output_shape(input.shape(), filter.shape())?;
    let src = input.read();
    let taps = filter.read();
    let mut out = vec![0.0; output.size()];
    for_each_tap(input.shape(), filter.shape(), output, params, flip, |o, x, f| {
        out[o] += src[x] * taps[f];
    });
    Ok(Matrix::from_parts(out, output))
}

fn input_gradient(
    output_gradient: &Matrix,
    filter: &Matrix,
    input_shape: Shape,
    params: ConvolutionParams,
    flip: bool,
) -> Result<Matrix> {
    params.validate()?;
    let output = check_gradient_shape(output_gradient, input_shape, filter.shape(), params)?;
    let grad = output_gradient.read();
    let taps = filter.read();
    let mut out = vec![0.0; input_shape.size()];
    for_each_tap(input_shape, filter.shape(), output, params, flip, |o, x, f| {
        out[x] += grad[o] * taps[f];
    });
    Ok(Matrix::from_parts(out, input_shape))
}

fn filter_gradient(
    output_gradient: &Matrix,
    input: &Matrix,
    filter_shape: Shape,
    params: ConvolutionParams,
    flip: bool,
) -> Result<Matrix> {
    params.validate()?;
    let output = check_gradient_shape(output_gradient, input.shape(), filter_shape, params)?;
    let grad = output_gradient.read();
    let src = input.read();
    let mut out = vec![0.0; filter_shape.size()];
    for_each_tap(input.shape(), filter_shape, output, params, flip, |o, x, f| {
        out[f] += grad[o] * src[x];
    });
    Ok(Matrix::from_parts(out, filter_shape))
}

fn check_gradient_shape(
    output_gradient: &Matrix,
    input: Shape,
    filter: Shape,
    params: ConvolutionParams,
) -> Result<Shape> {
    let output = params.output_shape(input, filter)?;
    if output_gradient.shape() != output {
        return Err(MatrixError::ShapeMismatch {
            op: "convolution gradient",
            left: output_gradient.shape(),
            right: output,
        });
    }
    Ok(output)
}
