//! Sum, mean, variance, standard deviation and p-norm.
//!
//! `PerIndex` reduces one sample's matrix to a scalar. `Aggregate` reduces
//! element-wise across every sample index into one shared result and spreads
//! the gradient back to each index.

use retrace_core::Matrix;

use crate::expression::{
    accumulate, argument, argument_values, result_gradient, store_result, Expression,
    ExpressionId, ReductionMode, UnaryOperands,
};
use crate::node::NodeArena;
use crate::Result;

#[derive(Debug, Clone, Copy)]
enum Reduction {
    Sum,
    Mean,
    Variance,
    StandardDeviation,
    Norm(f64),
}

impl Reduction {
    fn forward(self, a: &Matrix) -> Result<Matrix> {
        Ok(match self {
            Self::Sum => a.sum(),
            Self::Mean => a.mean(),
            Self::Variance => a.variance(a.mean_value()),
            Self::StandardDeviation => a.standard_deviation(a.mean_value()),
            Self::Norm(p) => a.norm(p)?,
        })
    }

    /// Local gradient of a per-index reduction; `r` is the scalar result.
    fn backward(self, a: &Matrix, r: &Matrix, gradient: &Matrix) -> Result<Matrix> {
        let n = a.size() as f64;
        let g = gradient.value();
        Ok(match self {
            Self::Sum => Matrix::filled(a.shape(), g),
            Self::Mean => Matrix::filled(a.shape(), g / n),
            Self::Variance => {
                let mean = a.mean_value();
                a.apply(move |x| 2.0 * (x - mean) / n * g)
            }
            Self::StandardDeviation => {
                let (mean, deviation) = (a.mean_value(), r.value());
                if deviation == 0.0 {
                    a.zeros_like()
                } else {
                    a.apply(move |x| (x - mean) / (n * deviation) * g)
                }
            }
            Self::Norm(p) => {
                let scale = r.value().powf(p - 1.0);
                if scale == 0.0 {
                    a.zeros_like()
                } else {
                    a.apply(move |x| x.abs().powf(p - 1.0) * x.signum() / scale * g)
                }
            }
        })
    }

    fn forward_all(self, values: &[Matrix]) -> Result<Matrix> {
        Ok(match self {
            Self::Sum => Matrix::sum_of(values)?,
            Self::Mean => Matrix::mean_of(values)?,
            Self::Variance => Matrix::variance_of(values, &Matrix::mean_of(values)?)?,
            Self::StandardDeviation => Matrix::variance_of(values, &Matrix::mean_of(values)?)?.apply(f64::sqrt),
            Self::Norm(p) => Matrix::norm_of(values, p)?,
        })
    }

    /// Local gradient of one sample `a` inside an aggregate reduction.
    fn backward_one(self, a: &Matrix, mean: &Matrix, r: &Matrix, gradient: &Matrix, n: f64) -> Result<Matrix> {
        let delta = match self {
            Self::Sum => gradient.clone(),
            Self::Mean => gradient.mul_scalar(1.0 / n),
            Self::Variance => a.sub(mean)?.mul_scalar(2.0 / n).mul(gradient)?,
            Self::StandardDeviation => a
                .sub(mean)?
                .apply_binary(r, move |d, s| if s == 0.0 { 0.0 } else { d / (n * s) })?
                .mul(gradient)?,
            Self::Norm(p) => a
                .apply_binary(r, move |x, s| {
                    if s == 0.0 {
                        0.0
                    } else {
                        x.abs().powf(p - 1.0) * x.signum() / s.powf(p - 1.0)
                    }
                })?
                .mul(gradient)?,
        };
        Ok(delta)
    }
}

macro_rules! reduction_expression {
    ($(#[$doc:meta])* $ty:ident, $name:literal, $rule:literal) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $ty {
            id: ExpressionId,
            operands: UnaryOperands,
            reduction: Reduction,
            mode: ReductionMode,
        }

        impl Expression for $ty {
            expression_header!($name);

            fn mode(&self) -> ReductionMode {
                self.mode
            }

            fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
                let a = argument(nodes, self.operands.argument, index, self.name())?;
                store_result(nodes, self.operands.result, index, self.reduction.forward(&a)?)
            }

            fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()> {
                let gradient = result_gradient(nodes, self.operands.result, index, self.name())?;
                let a = argument(nodes, self.operands.argument, index, self.name())?;
                let r = argument(nodes, self.operands.result, index, self.name())?;
                let delta = self.reduction.backward(&a, &r, &gradient)?;
                accumulate(nodes, self.operands.argument, index, &delta, true)
            }

            fn calculate_forward_aggregate(&mut self, nodes: &mut NodeArena) -> Result<()> {
                let values: Vec<Matrix> = argument_values(nodes, self.operands.argument, self.name())?
                    .into_iter()
                    .map(|(_, value)| value)
                    .collect();
                let value = self.reduction.forward_all(&values)?;
                store_result(nodes, self.operands.result, 0, value)
            }

            fn calculate_backward_aggregate(&mut self, nodes: &mut NodeArena) -> Result<()> {
                let gradient = result_gradient(nodes, self.operands.result, 0, self.name())?;
                let r = argument(nodes, self.operands.result, 0, self.name())?;
                let entries = argument_values(nodes, self.operands.argument, self.name())?;
                let values: Vec<Matrix> = entries.iter().map(|(_, value)| value.clone()).collect();
                let mean = Matrix::mean_of(&values)?;
                let n = values.len() as f64;
                for (index, a) in &entries {
                    let delta = self.reduction.backward_one(a, &mean, &r, &gradient, n)?;
                    accumulate(nodes, self.operands.argument, *index, &delta, true)?;
                }
                Ok(())
            }

            fn gradient_rule(&self) -> &'static str {
                $rule
            }
        }
    };
}

reduction_expression!(
    /// Sum of elements, or element-wise sum across indices.
    Sum,
    "SUM",
    "dA += dR"
);
reduction_expression!(
    /// Mean of elements, or element-wise mean across indices.
    Mean,
    "MEAN",
    "dA += dR / n"
);
reduction_expression!(
    /// Population variance.
    Variance,
    "VARIANCE",
    "dA += dR ⊙ 2(A - mean) / n"
);
reduction_expression!(
    /// Population standard deviation.
    StandardDeviation,
    "STANDARD_DEVIATION",
    "dA += dR ⊙ (A - mean) / (n · R)"
);
reduction_expression!(
    /// p-norm, `p >= 2`.
    Norm,
    "NORM",
    "dA += dR ⊙ |A|^(p-1) ⊙ sgn(A) / R^(p-1)"
);

impl Sum {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, mode: ReductionMode) -> Self {
        Self {
            id,
            operands,
            reduction: Reduction::Sum,
            mode,
        }
    }
}

impl Mean {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, mode: ReductionMode) -> Self {
        Self {
            id,
            operands,
            reduction: Reduction::Mean,
            mode,
        }
    }
}

impl Variance {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, mode: ReductionMode) -> Self {
        Self {
            id,
            operands,
            reduction: Reduction::Variance,
            mode,
        }
    }
}

impl StandardDeviation {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, mode: ReductionMode) -> Self {
        Self {
            id,
            operands,
            reduction: Reduction::StandardDeviation,
            mode,
        }
    }
}

impl Norm {
    pub(crate) fn new(id: ExpressionId, operands: UnaryOperands, p: f64, mode: ReductionMode) -> Self {
        Self {
            id,
            operands,
            reduction: Reduction::Norm(p),
            mode,
        }
    }
}
