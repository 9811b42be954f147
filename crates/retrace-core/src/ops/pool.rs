//! Pooling with a position side channel.
//!
//! Positional pools (max, cyclic, random) report, for every output cell, the
//! input cell it read. The gradient routes each output gradient back to exactly
//! that cell.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::ops::convolution::output_extent;
use crate::shape::Shape;
use crate::Result;

/// Pooling window size, stride and dilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolParams {
    pub rows: usize,
    pub columns: usize,
    pub stride: usize,
    pub dilation: usize,
}

impl PoolParams {
    /// Window of `rows × columns` with stride and dilation 1.
    pub fn new(rows: usize, columns: usize) -> Self {
        Self {
            rows,
            columns,
            stride: 1,
            dilation: 1,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Output shape when pooling `input`.
    pub fn output_shape(&self, input: Shape) -> Result<Shape> {
        let window = Shape::new(self.rows, self.columns);
        let rows = output_extent(input.rows(), self.rows, self.stride, self.dilation)
            .ok_or(MatrixError::Filter { filter: window, input })?;
        let columns = output_extent(input.columns(), self.columns, self.stride, self.dilation)
            .ok_or(MatrixError::Filter { filter: window, input })?;
        Ok(Shape::new_3d(rows, columns, input.depth()))
    }

    /// Number of cells in one window.
    pub fn window_size(&self) -> usize {
        self.rows * self.columns
    }

    fn input_position(&self, out_row: usize, out_column: usize, offset: usize) -> (usize, usize) {
        let (fr, fc) = (offset / self.columns, offset % self.columns);
        (
            out_row * self.stride + fr * self.dilation,
            out_column * self.stride + fc * self.dilation,
        )
    }
}

/// Input cell read by each output cell of a positional pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPositions {
    input_shape: Shape,
    output_shape: Shape,
    positions: Vec<(usize, usize)>,
}

impl PoolPositions {
    pub fn input_shape(&self) -> Shape {
        self.input_shape
    }

    pub fn output_shape(&self) -> Shape {
        self.output_shape
    }

    /// `(row, column)` of the input cell read by output cell `(row, column, depth)`.
    pub fn position(&self, row: usize, column: usize, depth: usize) -> Option<(usize, usize)> {
        if !self.output_shape.contains(row, column, depth) {
            return None;
        }
        self.positions
            .get(self.output_shape.offset(row, column, depth))
            .copied()
    }
}

impl Matrix {
    /// Max pooling. Ties keep the first maximum in row-major window order.
    pub fn max_pool(&self, params: PoolParams) -> Result<(Matrix, PoolPositions)> {
        positional_pool(self, params, |window| {
            window
                .iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        })
    }

    /// Random pooling: each output cell reads a uniformly chosen window cell.
    pub fn random_pool<R: Rng + ?Sized>(&self, params: PoolParams, rng: &mut R) -> Result<(Matrix, PoolPositions)> {
        let size = params.window_size();
        positional_pool(self, params, |_| rng.gen_range(0..size))
    }

    /// Cyclic pooling: output cells read window offsets in turn, row-major,
    /// continuing from `cursor` which is advanced past the last offset used.
    pub fn cyclic_pool(&self, params: PoolParams, cursor: &mut usize) -> Result<(Matrix, PoolPositions)> {
        let size = params.window_size();
        positional_pool(self, params, |_| {
            let offset = *cursor % size;
            *cursor = (offset + 1) % size;
            offset
        })
    }

    /// Average pooling.
    pub fn average_pool(&self, params: PoolParams) -> Result<Matrix> {
        let (sums, _) = positional_windows(self, params, |_| 0, true)?;
        Ok(sums.mul_scalar(1.0 / params.window_size() as f64))
    }

    /// Route `output_gradient` back through recorded pool positions.
    pub fn positional_pool_gradient(output_gradient: &Matrix, positions: &PoolPositions) -> Result<Matrix> {
        if output_gradient.shape() != positions.output_shape {
            return Err(MatrixError::ShapeMismatch {
                op: "positional_pool_gradient",
                left: output_gradient.shape(),
                right: positions.output_shape,
            });
        }
        let input_shape = positions.input_shape;
        let out_shape = positions.output_shape;
        let grad = output_gradient.read();
        let mut out = vec![0.0; input_shape.size()];
        for d in 0..out_shape.depth() {
            for i in 0..out_shape.rows() {
                for j in 0..out_shape.columns() {
                    let k = out_shape.offset(i, j, d);
                    let (r, c) = positions.positions[k];
                    out[input_shape.offset(r, c, d)] += grad[k];
                }
            }
        }
        Ok(Matrix::from_parts(out, input_shape))
    }

    /// Spread `output_gradient` evenly over each averaged window.
    pub fn average_pool_gradient(output_gradient: &Matrix, input_shape: Shape, params: PoolParams) -> Result<Matrix> {
        let out_shape = params.output_shape(input_shape)?;
        if output_gradient.shape() != out_shape {
            return Err(MatrixError::ShapeMismatch {
                op: "average_pool_gradient",
                left: output_gradient.shape(),
                right: out_shape,
            });
        }
        let scale = 1.0 / params.window_size() as f64;
        let grad = output_gradient.read();
        let mut out = vec![0.0; input_shape.size()];
        for d in 0..out_shape.depth() {
            for i in 0..out_shape.rows() {
                for j in 0..out_shape.columns() {
                    let g = grad[out_shape.offset(i, j, d)] * scale;
                    for offset in 0..params.window_size() {
                        let (r, c) = params.input_position(i, j, offset);
                        out[input_shape.offset(r, c, d)] += g;
                    }
                }
            }
        }
        Ok(Matrix::from_parts(out, input_shape))
    }
}

fn positional_pool(
    input: &Matrix,
    params: PoolParams,
    choose: impl FnMut(&[f64]) -> usize,
) -> Result<(Matrix, PoolPositions)> {
    positional_windows(input, params, choose, false)
}

/// Walk every window; either pick one cell via `choose` or sum the window.
fn positional_windows(
    input: &Matrix,
    params: PoolParams,
    mut choose: impl FnMut(&[f64]) -> usize,
    sum: bool,
) -> Result<(Matrix, PoolPositions)> {
    if params.stride == 0 || params.dilation == 0 || params.window_size() == 0 {
        return Err(MatrixError::InvalidParameter(format!(
            "invalid pool parameters {params:?}"
        )));
    }
    let input_shape = input.shape();
    let out_shape = params.output_shape(input_shape)?;
    let src = input.read();
    let mut out = vec![0.0; out_shape.size()];
    let mut positions = Vec::with_capacity(if sum { 0 } else { out_shape.size() });
    let mut window = vec![0.0; params.window_size()];

    for d in 0..out_shape.depth() {
        for i in 0..out_shape.rows() {
            for j in 0..out_shape.columns() {
                for (offset, slot) in window.iter_mut().enumerate() {
                    let (r, c) = params.input_position(i, j, offset);
                    *slot = src[input_shape.offset(r, c, d)];
                }
                let k = out_shape.offset(i, j, d);
                if sum {
                    out[k] = window.iter().sum();
                } else {
                    let offset = choose(&window);
                    out[k] = window[offset];
                    positions.push(params.input_position(i, j, offset));
                }
            }
        }
    }

    Ok((
        Matrix::from_parts(out, out_shape),
        PoolPositions {
            input_shape,
            output_shape: out_shape,
            positions,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn input_4x4() -> Matrix {
        Matrix::from_rows(&[
            &[1.0, 5.0, 2.0, 0.0],
            &[3.0, 4.0, 8.0, 1.0],
            &[0.0, 2.0, 1.0, 1.0],
            &[9.0, 1.0, 3.0, 7.0],
        ])
        .unwrap()
    }

    #[test]
    fn test_max_pool_positions() {
        let params = PoolParams::new(2, 2).with_stride(2);
        let (out, positions) = input_4x4().max_pool(params).unwrap();
        assert_eq!(out.to_vec(), vec![5.0, 8.0, 9.0, 7.0]);
        assert_eq!(positions.position(0, 0, 0), Some((0, 1)));
        assert_eq!(positions.position(0, 1, 0), Some((1, 2)));
        assert_eq!(positions.position(1, 0, 0), Some((3, 0)));
        assert_eq!(positions.position(1, 1, 0), Some((3, 3)));
        assert_eq!(positions.position(2, 0, 0), None);
    }

    #[test]
    fn test_max_pool_gradient_routes_to_max() {
        let params = PoolParams::new(2, 2).with_stride(2);
        let (_, positions) = input_4x4().max_pool(params).unwrap();
        let grad = Matrix::filled((2, 2), 1.0);
        let dx = Matrix::positional_pool_gradient(&grad, &positions).unwrap();
        assert_eq!(dx.sum_value(), 4.0);
        assert_eq!(dx.get(0, 1), 1.0);
        assert_eq!(dx.get(1, 2), 1.0);
        assert_eq!(dx.get(3, 0), 1.0);
        assert_eq!(dx.get(3, 3), 1.0);
        assert_eq!(dx.get(0, 0), 0.0);
    }

    #[test]
    fn test_average_pool() {
        let params = PoolParams::new(2, 2).with_stride(2);
        let out = input_4x4().average_pool(params).unwrap();
        assert_eq!(out.to_vec(), vec![13.0 / 4.0, 11.0 / 4.0, 12.0 / 4.0, 12.0 / 4.0]);
        let dx = Matrix::average_pool_gradient(&Matrix::filled((2, 2), 4.0), Shape::new(4, 4), params).unwrap();
        assert!(dx.to_vec().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_cyclic_pool_cycles_offsets() {
        let params = PoolParams::new(2, 2).with_stride(2);
        let mut cursor = 0;
        let (out, positions) = input_4x4().cyclic_pool(params, &mut cursor).unwrap();
        // Offsets 0, 1, 2, 3 in turn.
        assert_eq!(positions.position(0, 0, 0), Some((0, 0)));
        assert_eq!(positions.position(0, 1, 0), Some((0, 3)));
        assert_eq!(positions.position(1, 0, 0), Some((3, 0)));
        assert_eq!(positions.position(1, 1, 0), Some((3, 3)));
        assert_eq!(out.to_vec(), vec![1.0, 0.0, 9.0, 7.0]);
        assert_eq!(cursor, 0);
    }

    #[test]
    fn test_random_pool_reads_window_cells() {
        let params = PoolParams::new(2, 2).with_stride(2);
        let mut rng = StdRng::seed_from_u64(7);
        let input = input_4x4();
        let (out, positions) = input.random_pool(params, &mut rng).unwrap();
        for i in 0..2 {
            for j in 0..2 {
                let (r, c) = positions.position(i, j, 0).unwrap();
                assert!(r / 2 == i && c / 2 == j);
                assert_eq!(out.get(i, j), input.get(r, c));
            }
        }
    }

    #[test]
    fn test_window_too_large() {
        assert!(Matrix::zeros((2, 2)).max_pool(PoolParams::new(3, 3)).is_err());
    }
}
