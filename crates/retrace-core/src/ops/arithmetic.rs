//! Element-wise arithmetic and matrix products.

use rayon::prelude::*;

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::Result;

/// Element count above which element-wise kernels run on the rayon pool.
pub(crate) const PAR_THRESHOLD: usize = 16_384;

impl Matrix {
    /// Element-wise addition: self + other.
    pub fn add(&self, other: &Matrix) -> Result<Matrix> {
        binary_op(self, other, "add", |a, b| a + b)
    }

    /// Element-wise subtraction: self - other.
    pub fn sub(&self, other: &Matrix) -> Result<Matrix> {
        binary_op(self, other, "sub", |a, b| a - b)
    }

    /// Element-wise (Hadamard) product: self ⊙ other.
    pub fn mul(&self, other: &Matrix) -> Result<Matrix> {
        binary_op(self, other, "mul", |a, b| a * b)
    }

    /// Element-wise division: self / other.
    pub fn div(&self, other: &Matrix) -> Result<Matrix> {
        binary_op(self, other, "div", |a, b| a / b)
    }

    /// Element-wise negation.
    pub fn neg(&self) -> Matrix {
        self.apply(|a| -a)
    }

    /// Element-wise absolute value.
    pub fn abs(&self) -> Matrix {
        self.apply(f64::abs)
    }

    /// Element-wise sign, with `sgn(0) = 0`.
    pub fn sign(&self) -> Matrix {
        self.apply(signum)
    }

    /// Element-wise power: self^exponent.
    pub fn power(&self, exponent: f64) -> Matrix {
        self.apply(|a| a.powf(exponent))
    }

    /// Scalar addition: self + scalar.
    pub fn add_scalar(&self, scalar: f64) -> Matrix {
        self.apply(|a| a + scalar)
    }

    /// Scalar multiplication: self * scalar.
    pub fn mul_scalar(&self, scalar: f64) -> Matrix {
        self.apply(|a| a * scalar)
    }

    /// Apply `f` to every element.
    pub fn apply(&self, f: impl Fn(f64) -> f64 + Sync + Send) -> Matrix {
        let src = self.read();
        let data = if src.len() >= PAR_THRESHOLD {
            src.par_iter().map(|&a| f(a)).collect()
        } else {
            src.iter().map(|&a| f(a)).collect()
        };
        Matrix::from_parts(data, self.shape())
    }

    /// Apply `f(self, other)` element-wise, broadcasting a scalar operand.
    pub fn apply_binary(
        &self,
        other: &Matrix,
        f: impl Fn(f64, f64) -> f64 + Sync + Send,
    ) -> Result<Matrix> {
        binary_op(self, other, "apply_binary", f)
    }

    /// Matrix product per depth slice: [M, K] · [K, N] → [M, N].
    pub fn dot(&self, other: &Matrix) -> Result<Matrix> {
        if self.columns() != other.rows() || self.depth() != other.depth() {
            return Err(MatrixError::ShapeMismatch {
                op: "dot",
                left: self.shape(),
                right: other.shape(),
            });
        }
        let (m, k, n) = (self.rows(), self.columns(), other.columns());
        let a = self.read();
        let b = other.read();
        let mut out = vec![0.0; m * n * self.depth()];

        for depth in 0..self.depth() {
            let a_slice = &a[depth * m * k..(depth + 1) * m * k];
            let b_slice = &b[depth * k * n..(depth + 1) * k * n];
            let out_slice = &mut out[depth * m * n..(depth + 1) * m * n];
            let row_kernel = |(i, out_row): (usize, &mut [f64])| {
                for p in 0..k {
                    let a_ip = a_slice[i * k + p];
                    if a_ip == 0.0 {
                        continue;
                    }
                    let b_row = &b_slice[p * n..(p + 1) * n];
                    for (o, &b_pj) in out_row.iter_mut().zip(b_row) {
                        *o += a_ip * b_pj;
                    }
                }
            };
            if m * k * n >= PAR_THRESHOLD && n > 0 {
                out_slice.par_chunks_mut(n).enumerate().for_each(row_kernel);
            } else if n > 0 {
                out_slice.chunks_mut(n).enumerate().for_each(row_kernel);
            }
        }

        Ok(Matrix::from_parts(
            out,
            crate::Shape::new_3d(m, n, self.depth()),
        ))
    }
}

pub(crate) fn signum(a: f64) -> f64 {
    if a > 0.0 {
        1.0
    } else if a < 0.0 {
        -1.0
    } else {
        0.0
    }
}

fn binary_op(
    a: &Matrix,
    b: &Matrix,
    op: &'static str,
    f: impl Fn(f64, f64) -> f64 + Sync + Send,
) -> Result<Matrix> {
    let shape = a
        .shape()
        .broadcast_with(&b.shape())
        .ok_or(MatrixError::ShapeMismatch {
            op,
            left: a.shape(),
            right: b.shape(),
        })?;
    let lhs = a.read();
    let rhs = b.read();
    let parallel = shape.size() >= PAR_THRESHOLD;

    let data: Vec<f64> = if a.shape() == b.shape() {
        if parallel {
            lhs.par_iter().zip(rhs.par_iter()).map(|(&x, &y)| f(x, y)).collect()
        } else {
            lhs.iter().zip(rhs.iter()).map(|(&x, &y)| f(x, y)).collect()
        }
    } else if b.is_scalar() {
        let y = rhs[0];
        if parallel {
            lhs.par_iter().map(|&x| f(x, y)).collect()
        } else {
            lhs.iter().map(|&x| f(x, y)).collect()
        }
    } else {
        let x = lhs[0];
        if parallel {
            rhs.par_iter().map(|&y| f(x, y)).collect()
        } else {
            rhs.iter().map(|&y| f(x, y)).collect()
        }
    };
    Ok(Matrix::from_parts(data, shape))
}
