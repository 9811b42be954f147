//! Shape manipulation: transpose, join/unjoin, flatten, reshape.

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::shape::Shape;
use crate::Result;

/// Axis along which two matrices are joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinAxis {
    /// Stack vertically: rows add up.
    Rows,
    /// Place side by side: columns add up.
    Columns,
    /// Stack depth slices.
    Depth,
}

impl Matrix {
    /// Swap rows and columns of every depth slice.
    pub fn transpose(&self) -> Matrix {
        let shape = self.shape();
        let out_shape = shape.transpose();
        let src = self.read();
        let mut out = vec![0.0; shape.size()];
        for d in 0..shape.depth() {
            for r in 0..shape.rows() {
                for c in 0..shape.columns() {
                    out[out_shape.offset(c, r, d)] = src[shape.offset(r, c, d)];
                }
            }
        }
        Matrix::from_parts(out, out_shape)
    }

    /// Join `other` to `self` along `axis`.
    pub fn join(&self, other: &Matrix, axis: JoinAxis) -> Result<Matrix> {
        let (a, b) = (self.shape(), other.shape());
        let out_shape = match axis {
            JoinAxis::Rows if a.columns() == b.columns() && a.depth() == b.depth() => {
                Shape::new_3d(a.rows() + b.rows(), a.columns(), a.depth())
            }
            JoinAxis::Columns if a.rows() == b.rows() && a.depth() == b.depth() => {
                Shape::new_3d(a.rows(), a.columns() + b.columns(), a.depth())
            }
            JoinAxis::Depth if a.rows() == b.rows() && a.columns() == b.columns() => {
                Shape::new_3d(a.rows(), a.columns(), a.depth() + b.depth())
            }
            _ => {
                return Err(MatrixError::ShapeMismatch {
                    op: "join",
                    left: a,
                    right: b,
                })
            }
        };
        let (row_offset, column_offset, depth_offset) = join_offset(a, axis);
        let out = Matrix::zeros(out_shape);
        out.update(|data| {
            copy_block(&self.read(), a, data, out_shape, (0, 0, 0));
            copy_block(
                &other.read(),
                b,
                data,
                out_shape,
                (row_offset, column_offset, depth_offset),
            );
        });
        Ok(out)
    }

    /// Extract the block of `shape` starting at `(row, column, depth)`.
    pub fn unjoin(&self, at: (usize, usize, usize), shape: impl Into<Shape>) -> Result<Matrix> {
        let shape = shape.into();
        self.check_block(at, shape)?;
        let src = self.read();
        let source_shape = self.shape();
        let mut out = Vec::with_capacity(shape.size());
        for d in 0..shape.depth() {
            for r in 0..shape.rows() {
                let start = source_shape.offset(at.0 + r, at.1, at.2 + d);
                out.extend_from_slice(&src[start..start + shape.columns()]);
            }
        }
        Ok(Matrix::from_parts(out, shape))
    }

    /// Place `block` at `(row, column, depth)` of a zero matrix of `shape`.
    /// Inverse of [`Matrix::unjoin`] with respect to the extracted block.
    pub fn embed(block: &Matrix, at: (usize, usize, usize), shape: impl Into<Shape>) -> Result<Matrix> {
        let shape = shape.into();
        let out = Matrix::zeros(shape);
        out.check_block(at, block.shape())?;
        out.update(|data| copy_block(&block.read(), block.shape(), data, shape, at));
        Ok(out)
    }

    /// Column vector holding every element in storage order.
    pub fn flatten(&self) -> Matrix {
        Matrix::from_parts(self.to_vec(), self.shape().flattened())
    }

    /// Same elements in storage order with a new shape.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Matrix> {
        let shape = shape.into();
        if shape.size() != self.size() {
            return Err(MatrixError::ShapeMismatch {
                op: "reshape",
                left: self.shape(),
                right: shape,
            });
        }
        Ok(Matrix::from_parts(self.to_vec(), shape))
    }

    fn check_block(&self, at: (usize, usize, usize), shape: Shape) -> Result<()> {
        let outer = self.shape();
        if at.0 + shape.rows() > outer.rows()
            || at.1 + shape.columns() > outer.columns()
            || at.2 + shape.depth() > outer.depth()
        {
            return Err(MatrixError::IndexOutOfBounds {
                row: at.0 + shape.rows(),
                column: at.1 + shape.columns(),
                depth: at.2 + shape.depth(),
                shape: outer,
            });
        }
        Ok(())
    }
}

/// Offset at which the second operand of a join starts.
pub fn join_offset(first: Shape, axis: JoinAxis) -> (usize, usize, usize) {
    match axis {
        JoinAxis::Rows => (first.rows(), 0, 0),
        JoinAxis::Columns => (0, first.columns(), 0),
        JoinAxis::Depth => (0, 0, first.depth()),
    }
}

fn copy_block(src: &[f64], src_shape: Shape, dst: &mut [f64], dst_shape: Shape, at: (usize, usize, usize)) {
    for d in 0..src_shape.depth() {
        for r in 0..src_shape.rows() {
            let from = src_shape.offset(r, 0, d);
            let to = dst_shape.offset(at.0 + r, at.1, at.2 + d);
            dst[to..to + src_shape.columns()].copy_from_slice(&src[from..from + src_shape.columns()]);
        }
    }
}
