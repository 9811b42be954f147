//! Element-wise functions paired with their derivatives.

use std::f64::consts::PI;
use std::fmt;

use crate::error::MatrixError;
use crate::matrix::Matrix;
use crate::ops::arithmetic::signum;
use crate::Result;

/// Unary function with its derivative, evaluated at the function input.
#[derive(Debug, Clone, Copy)]
pub enum UnaryFunction {
    Abs,
    Cos,
    Cosh,
    Exp,
    Log,
    Log10,
    Sgn,
    Sin,
    Sinh,
    Sqrt,
    Cbrt,
    /// Multiplicative inverse `1 / x`.
    Reciprocal,
    Tan,
    Tanh,
    Linear,
    Sigmoid,
    Swish,
    HardSigmoid,
    BipolarSigmoid,
    TanhSig,
    HardTanh,
    Softplus,
    Softsign,
    Relu { threshold: f64, alpha: f64 },
    ReluCos,
    ReluSin,
    Elu { threshold: f64, alpha: f64 },
    Selu { threshold: f64, alpha: f64, lambda: f64 },
    Gelu,
    Gaussian,
    SinAct,
    Logit,
    /// Column-wise softmax over rows, per depth slice.
    Softmax,
    Custom {
        name: &'static str,
        function: fn(f64) -> f64,
        derivative: fn(f64) -> f64,
    },
}

impl UnaryFunction {
    /// ReLU with threshold 0 and no leak.
    pub const RELU: UnaryFunction = UnaryFunction::Relu {
        threshold: 0.0,
        alpha: 0.0,
    };

    /// ELU with threshold 0 and alpha 1.
    pub const ELU: UnaryFunction = UnaryFunction::Elu {
        threshold: 0.0,
        alpha: 1.0,
    };

    /// SELU with the usual self-normalizing constants.
    pub const SELU: UnaryFunction = UnaryFunction::Selu {
        threshold: 0.0,
        alpha: 1.6732,
        lambda: 1.0507,
    };

    pub fn name(&self) -> &'static str {
        match self {
            Self::Abs => "ABS",
            Self::Cos => "COS",
            Self::Cosh => "COSH",
            Self::Exp => "EXP",
            Self::Log => "LOG",
            Self::Log10 => "LOG10",
            Self::Sgn => "SGN",
            Self::Sin => "SIN",
            Self::Sinh => "SINH",
            Self::Sqrt => "SQRT",
            Self::Cbrt => "CBRT",
            Self::Reciprocal => "MULINV",
            Self::Tan => "TAN",
            Self::Tanh => "TANH",
            Self::Linear => "LINEAR",
            Self::Sigmoid => "SIGMOID",
            Self::Swish => "SWISH",
            Self::HardSigmoid => "HARDSIGMOID",
            Self::BipolarSigmoid => "BIPOLARSIGMOID",
            Self::TanhSig => "TANHSIG",
            Self::HardTanh => "HARDTANH",
            Self::Softplus => "SOFTPLUS",
            Self::Softsign => "SOFTSIGN",
            Self::Relu { .. } => "RELU",
            Self::ReluCos => "RELU_COS",
            Self::ReluSin => "RELU_SIN",
            Self::Elu { .. } => "ELU",
            Self::Selu { .. } => "SELU",
            Self::Gelu => "GELU",
            Self::Gaussian => "GAUSSIAN",
            Self::SinAct => "SINACT",
            Self::Logit => "LOGIT",
            Self::Softmax => "SOFTMAX",
            Self::Custom { name, .. } => *name,
        }
    }

    /// f(x). Softmax is not element-wise and reports `x` here; use [`apply`](Self::apply).
    pub fn value(&self, x: f64) -> f64 {
        match *self {
            Self::Abs => x.abs(),
            Self::Cos => x.cos(),
            Self::Cosh => x.cosh(),
            Self::Exp => x.exp(),
            Self::Log => x.ln(),
            Self::Log10 => x.log10(),
            Self::Sgn => signum(x),
            Self::Sin => x.sin(),
            Self::Sinh => x.sinh(),
            Self::Sqrt => x.sqrt(),
            Self::Cbrt => x.cbrt(),
            Self::Reciprocal => 1.0 / x,
            Self::Tan => x.tan(),
            Self::Tanh => x.tanh(),
            Self::Linear | Self::Softmax => x,
            Self::Sigmoid => sigmoid(x),
            Self::Swish => x * sigmoid(x),
            Self::HardSigmoid => (0.125 * x + 0.5).clamp(0.0, 1.0),
            Self::BipolarSigmoid => 2.0 * sigmoid(x) - 1.0,
            Self::TanhSig => 2.0 / ((-2.0 * x).exp() + 1.0) - 1.0,
            Self::HardTanh => (0.5 * x).clamp(-1.0, 1.0),
            Self::Softplus => x.exp().ln_1p(),
            Self::Softsign => x / (x.abs() + 1.0),
            Self::Relu { threshold, alpha } => {
                if x < threshold {
                    alpha * x
                } else {
                    x
                }
            }
            Self::ReluCos => x.max(0.0) + x.cos(),
            Self::ReluSin => x.max(0.0) + x.sin(),
            Self::Elu { threshold, alpha } => {
                if x < threshold {
                    alpha * (x.exp() - 1.0)
                } else {
                    x
                }
            }
            Self::Selu {
                threshold,
                alpha,
                lambda,
            } => {
                if x < threshold {
                    lambda * alpha * (x.exp() - 1.0)
                } else {
                    lambda * x
                }
            }
            Self::Gelu => 0.5 * x * (1.0 + gelu_inner(x).tanh()),
            Self::Gaussian => (-x * x / 2.0).exp(),
            Self::SinAct => {
                if x < -0.5 * PI {
                    -1.0
                } else if x > 0.5 * PI {
                    1.0
                } else {
                    x.sin()
                }
            }
            Self::Logit => (x / (1.0 - x)).ln(),
            Self::Custom { function, .. } => function(x),
        }
    }

    /// f'(x). Softmax is not element-wise and reports 1 here; use
    /// [`gradient`](Self::gradient).
    pub fn derivative(&self, x: f64) -> f64 {
        match *self {
            Self::Abs => signum(x),
            Self::Cos => -x.sin(),
            Self::Cosh => x.sinh(),
            Self::Exp => x.exp(),
            Self::Log => 1.0 / x,
            Self::Log10 => 1.0 / (10f64.ln() * x),
            Self::Sgn => 0.0,
            Self::Sin => x.cos(),
            Self::Sinh => x.cosh(),
            Self::Sqrt => 1.0 / (2.0 * x.sqrt()),
            Self::Cbrt => 1.0 / (3.0 * (x * x).cbrt()),
            Self::Reciprocal => -1.0 / (x * x),
            Self::Tan => 1.0 + x.tan().powi(2),
            Self::Tanh => 1.0 - x.tanh().powi(2),
            Self::Linear | Self::Softmax => 1.0,
            Self::Sigmoid => sigmoid(x) * (1.0 - sigmoid(x)),
            Self::Swish => {
                let s = sigmoid(x);
                s + x * s * (1.0 - s)
            }
            Self::HardSigmoid => {
                if !(-4.0..=4.0).contains(&x) {
                    0.0
                } else {
                    0.125
                }
            }
            Self::BipolarSigmoid => 2.0 * sigmoid(x) * (1.0 - sigmoid(x)),
            Self::TanhSig => {
                let e = (2.0 * x).exp();
                4.0 * e / (e + 1.0).powi(2)
            }
            Self::HardTanh => {
                if !(-2.0..=2.0).contains(&x) {
                    0.0
                } else {
                    0.5
                }
            }
            Self::Softplus => sigmoid(x),
            Self::Softsign => 1.0 / (x.abs() + 1.0).powi(2),
            Self::Relu { threshold, alpha } => {
                if x < threshold {
                    alpha
                } else {
                    1.0
                }
            }
            Self::ReluCos => (if x < 0.0 { 0.0 } else { 1.0 }) - x.sin(),
            Self::ReluSin => (if x < 0.0 { 0.0 } else { 1.0 }) + x.cos(),
            Self::Elu { threshold, alpha } => {
                if x < threshold {
                    alpha * x.exp()
                } else {
                    1.0
                }
            }
            Self::Selu {
                threshold,
                alpha,
                lambda,
            } => {
                if x < threshold {
                    lambda * alpha * x.exp()
                } else {
                    lambda
                }
            }
            Self::Gelu => {
                let t = gelu_inner(x).tanh();
                let d_inner = (2.0 / PI).sqrt() * (1.0 + 3.0 * 0.044715 * x * x);
                0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
            }
            Self::Gaussian => -x * (-x * x / 2.0).exp(),
            Self::SinAct => {
                if !(-0.5 * PI..=0.5 * PI).contains(&x) {
                    0.0
                } else {
                    x.cos()
                }
            }
            Self::Logit => 1.0 / (x * (1.0 - x)),
            Self::Custom { derivative, .. } => derivative(x),
        }
    }

    /// Apply the function to `input`.
    pub fn apply(&self, input: &Matrix) -> Matrix {
        match self {
            Self::Softmax => softmax(input),
            _ => {
                let function = *self;
                input.apply(move |x| function.value(x))
            }
        }
    }

    /// Gradient with respect to `input` given the function `output` and the
    /// gradient flowing into that output.
    pub fn gradient(&self, input: &Matrix, output: &Matrix, output_gradient: &Matrix) -> Result<Matrix> {
        match self {
            Self::Softmax => softmax_gradient(output, output_gradient),
            _ => {
                let function = *self;
                output_gradient.mul(&input.apply(move |x| function.derivative(x)))
            }
        }
    }
}

impl fmt::Display for UnaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary function `f(a, b)` with its derivative with respect to `a`.
///
/// Loss-style functions treat `a` as the prediction and `b` as the target and
/// stay element-wise; reduce them with a sum or mean afterwards.
#[derive(Debug, Clone, Copy)]
pub enum BinaryFunction {
    MeanSquaredError,
    MeanSquaredLogarithmicError,
    MeanAbsoluteError,
    CrossEntropy,
    KullbackLeibler,
    Poisson,
    Hinge,
    SquaredHinge,
    Huber { delta: f64 },
    Pow,
    Max,
    Min,
    Custom {
        name: &'static str,
        function: fn(f64, f64) -> f64,
        derivative: fn(f64, f64) -> f64,
    },
}

impl BinaryFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MeanSquaredError => "MEAN_SQUARED_ERROR",
            Self::MeanSquaredLogarithmicError => "MEAN_SQUARED_LOGARITHMIC_ERROR",
            Self::MeanAbsoluteError => "MEAN_ABSOLUTE_ERROR",
            Self::CrossEntropy => "CROSS_ENTROPY",
            Self::KullbackLeibler => "KULLBACK_LEIBLER",
            Self::Poisson => "POISSON",
            Self::Hinge => "HINGE",
            Self::SquaredHinge => "SQUARED_HINGE",
            Self::Huber { .. } => "HUBER",
            Self::Pow => "POW",
            Self::Max => "MAX",
            Self::Min => "MIN",
            Self::Custom { name, .. } => *name,
        }
    }

    pub fn value(&self, a: f64, b: f64) -> f64 {
        match *self {
            Self::MeanSquaredError => (a - b).powi(2),
            Self::MeanSquaredLogarithmicError => (a.ln_1p() - b.ln_1p()).powi(2),
            Self::MeanAbsoluteError => (a - b).abs(),
            Self::CrossEntropy => -b * a.ln(),
            Self::KullbackLeibler => b * (b / a).ln(),
            Self::Poisson => a - b * a.ln(),
            Self::Hinge => (1.0 - a * b).max(0.0),
            Self::SquaredHinge => (1.0 - a * b).max(0.0).powi(2),
            Self::Huber { delta } => {
                let d = a - b;
                if d.abs() <= delta {
                    0.5 * d * d
                } else {
                    delta * (d.abs() - 0.5 * delta)
                }
            }
            Self::Pow => a.powf(b),
            Self::Max => a.max(b),
            Self::Min => a.min(b),
            Self::Custom { function, .. } => function(a, b),
        }
    }

    /// ∂f/∂a at `(a, b)`.
    pub fn derivative(&self, a: f64, b: f64) -> f64 {
        match *self {
            Self::MeanSquaredError => 2.0 * (a - b),
            Self::MeanSquaredLogarithmicError => 2.0 * (a.ln_1p() - b.ln_1p()) / (a + 1.0),
            Self::MeanAbsoluteError => signum(a - b),
            Self::CrossEntropy | Self::KullbackLeibler => -b / a,
            Self::Poisson => 1.0 - b / a,
            Self::Hinge => {
                if 1.0 - a * b > 0.0 {
                    -b
                } else {
                    0.0
                }
            }
            Self::SquaredHinge => {
                let margin = 1.0 - a * b;
                if margin > 0.0 {
                    -2.0 * b * margin
                } else {
                    0.0
                }
            }
            Self::Huber { delta } => {
                let d = a - b;
                if d.abs() <= delta {
                    d
                } else {
                    delta * signum(d)
                }
            }
            Self::Pow => b * a.powf(b - 1.0),
            Self::Max => {
                if a >= b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Min => {
                if a <= b {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Custom { derivative, .. } => derivative(a, b),
        }
    }

    /// Apply the function element-wise, broadcasting a scalar operand.
    pub fn apply(&self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        let function = *self;
        a.apply_binary(b, move |x, y| function.value(x, y))
    }

    /// Gradient with respect to `a` given the gradient flowing into the output.
    pub fn gradient(&self, a: &Matrix, b: &Matrix, output_gradient: &Matrix) -> Result<Matrix> {
        let function = *self;
        output_gradient.mul(&a.apply_binary(b, move |x, y| function.derivative(x, y))?)
    }
}

impl fmt::Display for BinaryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn gelu_inner(x: f64) -> f64 {
    (2.0 / PI).sqrt() * (x + 0.044715 * x.powi(3))
}

fn softmax(input: &Matrix) -> Matrix {
    let shape = input.shape();
    let src = input.to_vec();
    let mut out = vec![0.0; shape.size()];
    for d in 0..shape.depth() {
        for c in 0..shape.columns() {
            let column = |r: usize| shape.offset(r, c, d);
            let max = (0..shape.rows())
                .map(|r| src[column(r)])
                .fold(f64::NEG_INFINITY, f64::max);
            let total: f64 = (0..shape.rows()).map(|r| (src[column(r)] - max).exp()).sum();
            for r in 0..shape.rows() {
                out[column(r)] = (src[column(r)] - max).exp() / total;
            }
        }
    }
    Matrix::from_parts(out, shape)
}

/// Jacobian-vector product of softmax: `s ⊙ (g - Σ s·g)` per column.
fn softmax_gradient(output: &Matrix, output_gradient: &Matrix) -> Result<Matrix> {
    let shape = output.shape();
    if output_gradient.shape() != shape {
        return Err(MatrixError::ShapeMismatch {
            op: "softmax_gradient",
            left: output_gradient.shape(),
            right: shape,
        });
    }
    let s = output.to_vec();
    let g = output_gradient.to_vec();
    let mut out = vec![0.0; shape.size()];
    for d in 0..shape.depth() {
        for c in 0..shape.columns() {
            let column = |r: usize| shape.offset(r, c, d);
            let weighted: f64 = (0..shape.rows()).map(|r| s[column(r)] * g[column(r)]).sum();
            for r in 0..shape.rows() {
                out[column(r)] = s[column(r)] * (g[column(r)] - weighted);
            }
        }
    }
    Ok(Matrix::from_parts(out, shape))
}
