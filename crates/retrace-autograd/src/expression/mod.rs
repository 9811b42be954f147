//! Traced operators with forward and local gradient rules.
//!
//! Each expression owns handles to its argument and result nodes. Forward
//! reads argument values at a sample index and writes the result; backward
//! reads the result gradient and accumulates into every argument that is
//! not stop-gradient.

/// Accessors shared by every expression: `id`, `name`, `arguments`, `result`.
macro_rules! expression_header {
    ($name:literal) => {
        fn id(&self) -> $crate::expression::ExpressionId {
            self.id
        }

        fn name(&self) -> &'static str {
            $name
        }

        fn arguments(&self) -> ::smallvec::SmallVec<[$crate::node::NodeId; 2]> {
            self.operands.arguments()
        }

        fn result(&self) -> $crate::node::NodeId {
            self.operands.result
        }
    };
}

mod arithmetic;
mod convolution;
mod function;
mod pool;
mod reduction;
mod regularization;
mod structure;

use std::fmt;

use rand::rngs::StdRng;
use retrace_core::{BinaryFunction, ConvolutionParams, JoinAxis, Matrix, PoolParams, Shape, UnaryFunction};
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::error::AutogradError;
use crate::node::{NodeArena, NodeId};
use crate::Result;

pub use arithmetic::{Add, Divide, Dot, Multiply, Subtract, Transpose};
pub use convolution::{Convolve, Crosscorrelate};
pub use function::{BinaryFunctionExpression, UnaryFunctionExpression};
pub use pool::{AveragePool, CyclicPool, MaxPool, RandomPool};
pub use reduction::{Norm, StandardDeviation, Sum, Mean, Variance};
pub use regularization::{Dropout, GradientClipping};
pub use structure::{Flatten, Join, Unjoin};

/// Creation order of an expression within its trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpressionId(usize);

impl ExpressionId {
    pub fn new(id: usize) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ExpressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a reduction works inside one sample or across all samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReductionMode {
    /// Reduce each sample's matrix to a scalar.
    #[default]
    PerIndex,
    /// Reduce element-wise across every sample index into one shared result.
    Aggregate,
}

/// One traced operator application `result = op(argument1[, argument2])`.
pub trait Expression: fmt::Debug + Send {
    fn id(&self) -> ExpressionId;

    /// Upper-case operator name used in descriptions.
    fn name(&self) -> &'static str;

    fn arguments(&self) -> SmallVec<[NodeId; 2]>;

    fn result(&self) -> NodeId;

    fn mode(&self) -> ReductionMode {
        ReductionMode::PerIndex
    }

    /// Compute the result at `index` from the argument values at `index`.
    fn calculate_forward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()>;

    /// Accumulate argument gradients at `index` from the result gradient.
    fn calculate_backward(&mut self, nodes: &mut NodeArena, index: usize) -> Result<()>;

    /// Compute a shared result from the argument values at every index.
    fn calculate_forward_aggregate(&mut self, _nodes: &mut NodeArena) -> Result<()> {
        Err(AutogradError::InvalidParameter(format!(
            "{} has no aggregate forward rule",
            self.name()
        )))
    }

    /// Distribute the shared result gradient to every argument index.
    fn calculate_backward_aggregate(&mut self, _nodes: &mut NodeArena) -> Result<()> {
        Err(AutogradError::InvalidParameter(format!(
            "{} has no aggregate gradient rule",
            self.name()
        )))
    }

    /// Drop per-index side state (pool positions, dropout masks).
    fn reset(&mut self) {}

    fn set_training(&mut self, _training: bool) {}

    /// Local derivative rule written over `A`, `B` (arguments) and `R` (result).
    fn gradient_rule(&self) -> &'static str;

    /// E.g. `Expression 3: DOT(node 1, node 2) = node 4`.
    fn signature(&self) -> String {
        let arguments: Vec<String> = self.arguments().iter().map(ToString::to_string).collect();
        format!(
            "Expression {}: {}({}) = {}",
            self.id(),
            self.name(),
            arguments.join(", "),
            self.result()
        )
    }

    /// E.g. `Expression 3: DOT: dA += dR · Bᵗ, dB += Aᵗ · dR`.
    fn gradient_signature(&self) -> String {
        format!("Expression {}: {}: {}", self.id(), self.name(), self.gradient_rule())
    }
}

// =============================================================================
// Operand handles
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct UnaryOperands {
    pub argument: NodeId,
    pub result: NodeId,
}

impl UnaryOperands {
    pub fn arguments(&self) -> SmallVec<[NodeId; 2]> {
        smallvec![self.argument]
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct BinaryOperands {
    pub argument1: NodeId,
    pub argument2: NodeId,
    pub result: NodeId,
}

impl BinaryOperands {
    pub fn arguments(&self) -> SmallVec<[NodeId; 2]> {
        smallvec![self.argument1, self.argument2]
    }
}

// =============================================================================
// Node access helpers
// =============================================================================

/// Value of `node` at `index`, or a missing-argument error.
pub(crate) fn argument(nodes: &NodeArena, node: NodeId, index: usize, expression: &'static str) -> Result<Matrix> {
    nodes
        .get(node)?
        .value(index)
        .cloned()
        .ok_or(AutogradError::MissingArgument { expression, index })
}

/// Every `(index, value)` of `node`; a single-slot node reports index 0.
pub(crate) fn argument_values(
    nodes: &NodeArena,
    node: NodeId,
    expression: &'static str,
) -> Result<Vec<(usize, Matrix)>> {
    let node = nodes.get(node)?;
    let values: Vec<(usize, Matrix)> = if node.is_multi_index() {
        node.indices()
            .into_iter()
            .filter_map(|index| node.value(index).map(|value| (index, value.clone())))
            .collect()
    } else {
        node.value(0).map(|value| vec![(0, value.clone())]).unwrap_or_default()
    };
    if values.is_empty() {
        return Err(AutogradError::MissingArgument { expression, index: 0 });
    }
    Ok(values)
}

/// Gradient of `node` at `index`, or a missing-gradient error.
pub(crate) fn result_gradient(nodes: &NodeArena, node: NodeId, index: usize, expression: &'static str) -> Result<Matrix> {
    nodes
        .get(node)?
        .gradient(index)
        .cloned()
        .ok_or(AutogradError::MissingGradient { expression, index })
}

pub(crate) fn store_result(nodes: &mut NodeArena, node: NodeId, index: usize, value: Matrix) -> Result<()> {
    nodes.get_mut(node)?.set_value(index, value);
    Ok(())
}

/// Add or subtract `delta` into the gradient of `node` at `index`.
pub(crate) fn accumulate(nodes: &mut NodeArena, node: NodeId, index: usize, delta: &Matrix, add: bool) -> Result<()> {
    nodes.get_mut(node)?.accumulate_gradient(index, delta, add)
}

/// Whether gradients written to `node` are kept.
pub(crate) fn wants_gradient(nodes: &NodeArena, node: NodeId) -> Result<bool> {
    Ok(!nodes.get(node)?.is_stop_gradient())
}

// =============================================================================
// Operation
// =============================================================================

/// Operator selected when tracing, with its construction parameters.
#[derive(Debug, Clone, Copy)]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Dot,
    Transpose,
    Convolve(ConvolutionParams),
    Crosscorrelate(ConvolutionParams),
    MaxPool(PoolParams),
    AveragePool(PoolParams),
    CyclicPool(PoolParams),
    RandomPool(PoolParams),
    Sum(ReductionMode),
    Mean(ReductionMode),
    Variance(ReductionMode),
    StandardDeviation(ReductionMode),
    Norm { p: f64, mode: ReductionMode },
    Unary(UnaryFunction),
    Binary(BinaryFunction),
    Join(JoinAxis),
    Unjoin { at: (usize, usize, usize), shape: Shape },
    Flatten,
    /// Drops each cell with `probability` when training or `monte_carlo` is set.
    Dropout { probability: f64, monte_carlo: bool },
    GradientClipping { threshold: f64 },
}

impl Operation {
    /// Number of matrix operands.
    pub fn arity(&self) -> usize {
        match self {
            Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Dot
            | Self::Convolve(_)
            | Self::Crosscorrelate(_)
            | Self::Binary(_)
            | Self::Join(_) => 2,
            _ => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Subtract => "SUB",
            Self::Multiply => "MUL",
            Self::Divide => "DIV",
            Self::Dot => "DOT",
            Self::Transpose => "TRANSPOSE",
            Self::Convolve(_) => "CONVOLVE",
            Self::Crosscorrelate(_) => "CROSSCORRELATE",
            Self::MaxPool(_) => "MAX_POOL",
            Self::AveragePool(_) => "AVERAGE_POOL",
            Self::CyclicPool(_) => "CYCLIC_POOL",
            Self::RandomPool(_) => "RANDOM_POOL",
            Self::Sum(_) => "SUM",
            Self::Mean(_) => "MEAN",
            Self::Variance(_) => "VARIANCE",
            Self::StandardDeviation(_) => "STANDARD_DEVIATION",
            Self::Norm { .. } => "NORM",
            Self::Unary(_) => "UNARY_FUNCTION",
            Self::Binary(_) => "BINARY_FUNCTION",
            Self::Join(_) => "JOIN",
            Self::Unjoin { .. } => "UNJOIN",
            Self::Flatten => "FLATTEN",
            Self::Dropout { .. } => "DROPOUT",
            Self::GradientClipping { .. } => "GRADIENT_CLIPPING",
        }
    }

    /// Reduction mode, `PerIndex` for non-reductions.
    pub fn mode(&self) -> ReductionMode {
        match self {
            Self::Sum(mode)
            | Self::Mean(mode)
            | Self::Variance(mode)
            | Self::StandardDeviation(mode)
            | Self::Norm { mode, .. } => *mode,
            _ => ReductionMode::PerIndex,
        }
    }

    /// Reject parameters no expression can run with.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Norm { p, .. } if p.is_nan() || p < 2.0 => Err(AutogradError::InvalidParameter(
                "Norm p value must be at least 2.".to_string(),
            )),
            Self::Dropout { probability, .. } if !(0.0..=1.0).contains(&probability) => {
                Err(AutogradError::InvalidParameter(format!(
                    "Probability must be between 0 and 1, got {probability}"
                )))
            }
            Self::GradientClipping { threshold } if threshold.is_nan() || threshold <= 0.0 => {
                Err(AutogradError::InvalidParameter(format!(
                    "Clipping threshold must be positive, got {threshold}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Eager value of the operation on trace-time operands.
    ///
    /// Dropout is inactive while tracing and random pooling reads the first
    /// cell of each window; both only need the right result shape here.
    pub fn evaluate(&self, arguments: &[&Matrix]) -> Result<Matrix> {
        self.validate()?;
        let (a, b) = self.operands(arguments)?;
        let value = match *self {
            Self::Add => a.add(second(b)?)?,
            Self::Subtract => a.sub(second(b)?)?,
            Self::Multiply => a.mul(second(b)?)?,
            Self::Divide => a.div(second(b)?)?,
            Self::Dot => a.dot(second(b)?)?,
            Self::Transpose => a.transpose(),
            Self::Convolve(params) => a.convolve(second(b)?, params)?,
            Self::Crosscorrelate(params) => a.crosscorrelate(second(b)?, params)?,
            Self::MaxPool(params) => a.max_pool(params)?.0,
            Self::AveragePool(params) => a.average_pool(params)?,
            Self::CyclicPool(params) | Self::RandomPool(params) => a.cyclic_pool(params, &mut 0)?.0,
            Self::Sum(ReductionMode::PerIndex) => a.sum(),
            Self::Mean(ReductionMode::PerIndex) => a.mean(),
            Self::Variance(ReductionMode::PerIndex) => a.variance(a.mean_value()),
            Self::StandardDeviation(ReductionMode::PerIndex) => a.standard_deviation(a.mean_value()),
            Self::Norm {
                p,
                mode: ReductionMode::PerIndex,
            } => a.norm(p)?,
            Self::Sum(ReductionMode::Aggregate) | Self::Mean(ReductionMode::Aggregate) => a.deep_copy(),
            Self::Variance(ReductionMode::Aggregate) | Self::StandardDeviation(ReductionMode::Aggregate) => {
                a.zeros_like()
            }
            Self::Norm {
                mode: ReductionMode::Aggregate,
                ..
            } => a.abs(),
            Self::Unary(function) => function.apply(a),
            Self::Binary(function) => function.apply(a, second(b)?)?,
            Self::Join(axis) => a.join(second(b)?, axis)?,
            Self::Unjoin { at, shape } => a.unjoin(at, shape)?,
            Self::Flatten => a.flatten(),
            Self::Dropout { .. } | Self::GradientClipping { .. } => a.deep_copy(),
        };
        Ok(value)
    }

    fn operands<'a>(&self, arguments: &[&'a Matrix]) -> Result<(&'a Matrix, Option<&'a Matrix>)> {
        if arguments.len() != self.arity() {
            return Err(AutogradError::InvalidParameter(format!(
                "{} takes {} argument(s), got {}",
                self.name(),
                self.arity(),
                arguments.len()
            )));
        }
        Ok((arguments[0], arguments.get(1).copied()))
    }

    /// Build the traced expression over already registered nodes.
    pub(crate) fn into_expression(
        self,
        id: ExpressionId,
        arguments: &[NodeId],
        result: NodeId,
        rng: StdRng,
    ) -> Result<Box<dyn Expression>> {
        self.validate()?;
        if arguments.len() != self.arity() {
            return Err(AutogradError::InvalidParameter(format!(
                "{} takes {} argument(s), got {}",
                self.name(),
                self.arity(),
                arguments.len()
            )));
        }
        let unary = UnaryOperands {
            argument: arguments[0],
            result,
        };
        let binary = || BinaryOperands {
            argument1: arguments[0],
            argument2: arguments[arguments.len() - 1],
            result,
        };
        let expression: Box<dyn Expression> = match self {
            Self::Add => Box::new(Add::new(id, binary())),
            Self::Subtract => Box::new(Subtract::new(id, binary())),
            Self::Multiply => Box::new(Multiply::new(id, binary())),
            Self::Divide => Box::new(Divide::new(id, binary())),
            Self::Dot => Box::new(Dot::new(id, binary())),
            Self::Transpose => Box::new(Transpose::new(id, unary)),
            Self::Convolve(params) => Box::new(Convolve::new(id, binary(), params)),
            Self::Crosscorrelate(params) => Box::new(Crosscorrelate::new(id, binary(), params)),
            Self::MaxPool(params) => Box::new(MaxPool::new(id, unary, params)),
            Self::AveragePool(params) => Box::new(AveragePool::new(id, unary, params)),
            Self::CyclicPool(params) => Box::new(CyclicPool::new(id, unary, params)),
            Self::RandomPool(params) => Box::new(RandomPool::new(id, unary, params, rng)),
            Self::Sum(mode) => Box::new(Sum::new(id, unary, mode)),
            Self::Mean(mode) => Box::new(Mean::new(id, unary, mode)),
            Self::Variance(mode) => Box::new(Variance::new(id, unary, mode)),
            Self::StandardDeviation(mode) => Box::new(StandardDeviation::new(id, unary, mode)),
            Self::Norm { p, mode } => Box::new(Norm::new(id, unary, p, mode)),
            Self::Unary(function) => Box::new(UnaryFunctionExpression::new(id, unary, function)),
            Self::Binary(function) => Box::new(BinaryFunctionExpression::new(id, binary(), function)),
            Self::Join(axis) => Box::new(Join::new(id, binary(), axis)),
            Self::Unjoin { at, shape } => Box::new(Unjoin::new(id, unary, at, shape)),
            Self::Flatten => Box::new(Flatten::new(id, unary)),
            Self::Dropout {
                probability,
                monte_carlo,
            } => Box::new(Dropout::new(id, unary, probability, monte_carlo, rng)),
            Self::GradientClipping { threshold } => Box::new(GradientClipping::new(id, unary, threshold)),
        };
        Ok(expression)
    }
}

fn second(argument: Option<&Matrix>) -> Result<&Matrix> {
    argument.ok_or_else(|| AutogradError::InvalidParameter("Second argument missing".to_string()))
}
