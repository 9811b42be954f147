//! Tracing and procedure construction.
//!
//! A [`ForwardProcedure`] is traced twice: once against the previous step's
//! inputs and once against the current step's. An argument of the current
//! trace that was produced by expression `j` of the previous trace is fed,
//! at run time, by expression `j` of the current trace one sample earlier.
//! That is the only way recurrence is discovered.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use retrace_core::{BinaryFunction, ConvolutionParams, JoinAxis, Matrix, MatrixId, PoolParams, Shape, UnaryFunction};
use tracing::{debug, info, trace, warn};

use crate::config::{FactoryConfig, LockMode};
use crate::error::AutogradError;
use crate::expression::{Expression, ExpressionId, Operation, ReductionMode};
use crate::node::{NodeId, NodeKind};
use crate::procedure::{Procedure, ProcedureParts};
use crate::register::NodeRegister;
use crate::Result;

const PREVIOUS_TRACE: usize = 0;
const CURRENT_TRACE: usize = 1;

/// Token held by the caller appending the ongoing expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpressionLock(u64);

impl fmt::Display for ExpressionLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock {:016x}", self.0)
    }
}

/// A computation that can be traced into a [`Procedure`].
pub trait ForwardProcedure {
    /// Input matrices keyed by position. Called with `reset_previous` before
    /// the first trace so recurrent state can start from scratch.
    fn input_matrices(&mut self, reset_previous: bool) -> Result<BTreeMap<usize, Matrix>>;

    /// Run the computation through `session` and return the outputs.
    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>>;

    /// Trainable matrices. Each must be referenced by the computation.
    fn parameter_matrices(&self) -> Vec<Matrix>;

    /// Non-trainable matrices shared by every sample.
    fn constant_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }

    /// Parameters the procedure's regularizers apply to. Defaults to every
    /// parameter; each must also be listed by [`Self::parameter_matrices`].
    fn regularized_matrices(&self) -> Vec<Matrix> {
        self.parameter_matrices()
    }

    /// Matrices whose nodes never receive gradients.
    fn stop_gradient_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }

    /// Walk samples in descending index order.
    fn reversed_input(&self) -> bool {
        false
    }

    /// Join every sample's input entries vertically into input 0.
    fn joined_input(&self) -> bool {
        false
    }
}

/// Everything one trace produced.
struct TraceRecord {
    register: NodeRegister,
    expressions: Vec<Box<dyn Expression>>,
    producers: HashMap<NodeId, usize>,
    results: HashMap<MatrixId, usize>,
    dependencies: Vec<(usize, NodeId)>,
    inputs: BTreeMap<usize, NodeId>,
    outputs: BTreeMap<usize, NodeId>,
}

/// Recording context for one trace of a [`ForwardProcedure`].
///
/// Operations called through the session are evaluated eagerly and appended
/// to the trace. Only the holder of the expression lock may append.
pub struct TraceSession<'a> {
    config: &'a FactoryConfig,
    register: NodeRegister,
    declared: HashSet<MatrixId>,
    previous_results: Option<&'a HashMap<MatrixId, usize>>,
    expressions: Vec<Box<dyn Expression>>,
    producers: HashMap<NodeId, usize>,
    results: HashMap<MatrixId, usize>,
    dependencies: Vec<(usize, NodeId)>,
    lock: Option<ExpressionLock>,
}

impl<'a> TraceSession<'a> {
    fn new(
        trace: usize,
        config: &'a FactoryConfig,
        declared: HashSet<MatrixId>,
        previous_results: Option<&'a HashMap<MatrixId, usize>>,
    ) -> Self {
        Self {
            config,
            register: NodeRegister::new(trace),
            declared,
            previous_results,
            expressions: Vec::new(),
            producers: HashMap::new(),
            results: HashMap::new(),
            dependencies: Vec::new(),
            lock: None,
        }
    }

    /// Number of expressions recorded so far.
    pub fn expression_count(&self) -> usize {
        self.expressions.len()
    }

    // =========================================================================
    // Expression lock
    // =========================================================================

    /// Reserve the trace for one expression.
    ///
    /// While another lock is held, strict mode fails with
    /// [`AutogradError::Reserved`] and lenient mode returns `None`: the
    /// operation is still evaluated but not recorded.
    pub fn start_expression(&mut self) -> Result<Option<ExpressionLock>> {
        if let Some(holder) = self.lock {
            return match self.config.lock_mode {
                LockMode::Strict => Err(AutogradError::Reserved { holder }),
                LockMode::Lenient => {
                    warn!(%holder, "nested operation ignored while the trace is reserved");
                    Ok(None)
                }
            };
        }
        let lock = ExpressionLock(rand::thread_rng().gen());
        self.lock = Some(lock);
        Ok(Some(lock))
    }

    /// Whether `lock` owns the ongoing expression.
    pub fn check_ongoing_expression(&self, lock: ExpressionLock) -> bool {
        self.lock == Some(lock)
    }

    /// Release the reservation held by `lock`.
    pub fn end_expression(&mut self, lock: ExpressionLock) -> Result<()> {
        if !self.check_ongoing_expression(lock) {
            return Err(AutogradError::LockMismatch { given: lock });
        }
        self.lock = None;
        Ok(())
    }

    /// Append `result = operation(arguments)` to the trace.
    pub fn create_expression(
        &mut self,
        lock: ExpressionLock,
        operation: Operation,
        arguments: &[&Matrix],
        result: &Matrix,
    ) -> Result<()> {
        if !self.check_ongoing_expression(lock) {
            return Err(AutogradError::LockMismatch { given: lock });
        }
        let position = self.expressions.len();
        let id = ExpressionId::new(position);

        let argument_nodes = arguments
            .iter()
            .map(|matrix| self.resolve_argument(matrix))
            .collect::<Result<Vec<_>>>()?;

        let shared = {
            let arena = self.register.arena();
            let kinds = argument_nodes
                .iter()
                .map(|&node| arena.get(node).map(|n| n.kind()))
                .collect::<Result<Vec<_>>>()?;
            kinds.contains(&NodeKind::Shared) && !kinds.contains(&NodeKind::MultiIndex)
        };
        let kind = if operation.mode() == ReductionMode::Aggregate || shared {
            NodeKind::Shared
        } else {
            NodeKind::MultiIndex
        };
        let result_node = self.register.define(result, kind, Some(id));

        let expression = operation.into_expression(id, &argument_nodes, result_node, self.expression_rng(id))?;
        trace!(signature = %expression.signature(), "traced");
        self.expressions.push(expression);
        self.producers.insert(result_node, position);
        self.results.insert(result.id(), position);
        Ok(())
    }

    fn expression_rng(&self, id: ExpressionId) -> StdRng {
        match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id.index() as u64)),
            None => StdRng::from_entropy(),
        }
    }

    /// Node for an operand, creating it on first reference.
    ///
    /// Declared parameters and constants become constant nodes. A matrix the
    /// previous trace produced becomes a per-sample node fed across steps.
    /// Anything else is an implicit constant.
    fn resolve_argument(&mut self, matrix: &Matrix) -> Result<NodeId> {
        if let Some(node) = self.register.node_of(matrix) {
            return Ok(node);
        }
        if self.declared.contains(&matrix.id()) {
            return Ok(self.register.define(matrix, NodeKind::Constant, None));
        }
        if let Some(&producer) = self.previous_results.and_then(|results| results.get(&matrix.id())) {
            let node = self.register.define(matrix, NodeKind::MultiIndex, None);
            self.dependencies.push((producer, node));
            return Ok(node);
        }
        Ok(self.register.define(matrix, NodeKind::Constant, None))
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Evaluate `operation` and record it.
    pub fn apply(&mut self, operation: Operation, arguments: &[&Matrix]) -> Result<Matrix> {
        let Some(lock) = self.start_expression()? else {
            return operation.evaluate(arguments);
        };
        let outcome = operation.evaluate(arguments).and_then(|result| {
            self.create_expression(lock, operation, arguments, &result)?;
            Ok(result)
        });
        self.end_expression(lock)?;
        outcome
    }

    pub fn add(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Add, &[a, b])
    }

    pub fn sub(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Subtract, &[a, b])
    }

    pub fn mul(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Multiply, &[a, b])
    }

    pub fn div(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Divide, &[a, b])
    }

    pub fn dot(&mut self, a: &Matrix, b: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Dot, &[a, b])
    }

    pub fn transpose(&mut self, a: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Transpose, &[a])
    }

    pub fn convolve(&mut self, input: &Matrix, filter: &Matrix, params: ConvolutionParams) -> Result<Matrix> {
        self.apply(Operation::Convolve(params), &[input, filter])
    }

    pub fn crosscorrelate(&mut self, input: &Matrix, filter: &Matrix, params: ConvolutionParams) -> Result<Matrix> {
        self.apply(Operation::Crosscorrelate(params), &[input, filter])
    }

    pub fn max_pool(&mut self, a: &Matrix, params: PoolParams) -> Result<Matrix> {
        self.apply(Operation::MaxPool(params), &[a])
    }

    pub fn average_pool(&mut self, a: &Matrix, params: PoolParams) -> Result<Matrix> {
        self.apply(Operation::AveragePool(params), &[a])
    }

    pub fn cyclic_pool(&mut self, a: &Matrix, params: PoolParams) -> Result<Matrix> {
        self.apply(Operation::CyclicPool(params), &[a])
    }

    pub fn random_pool(&mut self, a: &Matrix, params: PoolParams) -> Result<Matrix> {
        self.apply(Operation::RandomPool(params), &[a])
    }

    pub fn sum(&mut self, a: &Matrix, mode: ReductionMode) -> Result<Matrix> {
        self.apply(Operation::Sum(mode), &[a])
    }

    pub fn mean(&mut self, a: &Matrix, mode: ReductionMode) -> Result<Matrix> {
        self.apply(Operation::Mean(mode), &[a])
    }

    pub fn variance(&mut self, a: &Matrix, mode: ReductionMode) -> Result<Matrix> {
        self.apply(Operation::Variance(mode), &[a])
    }

    pub fn standard_deviation(&mut self, a: &Matrix, mode: ReductionMode) -> Result<Matrix> {
        self.apply(Operation::StandardDeviation(mode), &[a])
    }

    pub fn norm(&mut self, a: &Matrix, p: f64, mode: ReductionMode) -> Result<Matrix> {
        self.apply(Operation::Norm { p, mode }, &[a])
    }

    pub fn unary(&mut self, a: &Matrix, function: UnaryFunction) -> Result<Matrix> {
        self.apply(Operation::Unary(function), &[a])
    }

    pub fn binary(&mut self, a: &Matrix, b: &Matrix, function: BinaryFunction) -> Result<Matrix> {
        self.apply(Operation::Binary(function), &[a, b])
    }

    pub fn join(&mut self, a: &Matrix, b: &Matrix, axis: JoinAxis) -> Result<Matrix> {
        self.apply(Operation::Join(axis), &[a, b])
    }

    pub fn unjoin(&mut self, a: &Matrix, at: (usize, usize, usize), shape: impl Into<Shape>) -> Result<Matrix> {
        self.apply(
            Operation::Unjoin {
                at,
                shape: shape.into(),
            },
            &[a],
        )
    }

    pub fn flatten(&mut self, a: &Matrix) -> Result<Matrix> {
        self.apply(Operation::Flatten, &[a])
    }

    pub fn dropout(&mut self, a: &Matrix, probability: f64, monte_carlo: bool) -> Result<Matrix> {
        self.apply(
            Operation::Dropout {
                probability,
                monte_carlo,
            },
            &[a],
        )
    }

    pub fn gradient_clipping(&mut self, a: &Matrix, threshold: f64) -> Result<Matrix> {
        self.apply(Operation::GradientClipping { threshold }, &[a])
    }

    fn finish(self, inputs: BTreeMap<usize, NodeId>, outputs: BTreeMap<usize, NodeId>) -> TraceRecord {
        TraceRecord {
            register: self.register,
            expressions: self.expressions,
            producers: self.producers,
            results: self.results,
            dependencies: self.dependencies,
            inputs,
            outputs,
        }
    }
}

/// Builds [`Procedure`]s from forward procedure definitions.
#[derive(Debug, Clone, Default)]
pub struct ProcedureFactory {
    config: FactoryConfig,
}

impl ProcedureFactory {
    pub fn new(config: FactoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Trace `definition` twice, discover cross-step dependencies and return
    /// the executable procedure of the current trace.
    pub fn get_procedure<D>(&self, definition: &mut D) -> Result<Procedure>
    where
        D: ForwardProcedure + ?Sized,
    {
        let parameters = definition.parameter_matrices();
        let constants = definition.constant_matrices();
        let declared: HashSet<MatrixId> = parameters.iter().chain(&constants).map(Matrix::id).collect();

        let previous_inputs = definition.input_matrices(true)?;
        let previous = self.trace(definition, PREVIOUS_TRACE, previous_inputs, declared.clone(), None)?;
        let current_inputs = definition.input_matrices(false)?;
        let mut current = self.trace(definition, CURRENT_TRACE, current_inputs, declared, Some(&previous.results))?;

        check_trace_operations(&previous, &current)?;

        if let Some(missing) = parameters.iter().chain(&constants).find(|m| !current.register.node_exists(m)) {
            return Err(AutogradError::UntracedParameter(missing.id()));
        }
        for matrix in definition.stop_gradient_matrices() {
            current.register.mark_stop_gradient(&matrix)?;
        }

        for &(producer, argument) in &current.dependencies {
            let result = current.expressions[producer].result();
            current.register.arena_mut().link(result, argument)?;
            debug!(%result, %argument, expression = producer, "cross-step dependency");
        }
        check_trace_results(&previous, &current)?;
        drop(previous);
        let dependent_nodes: BTreeSet<NodeId> = current
            .register
            .arena()
            .iter()
            .filter(|node| node.is_dependent())
            .map(|node| node.id())
            .collect();

        let gradient_chain = gradient_path(&current)?;
        let parameter_nodes: Vec<(Matrix, NodeId)> = parameters
            .iter()
            .filter_map(|matrix| current.register.node_of(matrix).map(|node| (matrix.clone(), node)))
            .collect();
        let regularized = definition
            .regularized_matrices()
            .iter()
            .map(|matrix| {
                parameter_nodes
                    .iter()
                    .find(|(parameter, _)| parameter.id() == matrix.id())
                    .map(|(_, node)| *node)
                    .ok_or(AutogradError::UnregisteredMatrix(matrix.id()))
            })
            .collect::<Result<Vec<NodeId>>>()?;

        let TraceRecord {
            register,
            expressions,
            inputs,
            outputs,
            ..
        } = current;
        let nodes = register.detach();
        info!(
            expressions = expressions.len(),
            nodes = nodes.len(),
            dependencies = dependent_nodes.len(),
            "procedure built"
        );

        Procedure::new(ProcedureParts {
            nodes,
            expressions,
            gradient_chain,
            inputs,
            outputs,
            parameters: parameter_nodes,
            regularized,
            dependent_nodes,
            reversed_input: definition.reversed_input(),
            joined_input: definition.joined_input(),
        })
    }

    fn trace<D>(
        &self,
        definition: &mut D,
        trace: usize,
        inputs: BTreeMap<usize, Matrix>,
        declared: HashSet<MatrixId>,
        previous_results: Option<&HashMap<MatrixId, usize>>,
    ) -> Result<TraceRecord>
    where
        D: ForwardProcedure + ?Sized,
    {
        let mut session = TraceSession::new(trace, &self.config, declared, previous_results);
        let input_nodes: BTreeMap<usize, NodeId> = inputs
            .iter()
            .map(|(&position, matrix)| (position, session.register.define(matrix, NodeKind::MultiIndex, None)))
            .collect();

        let outputs = definition.forward_procedure(&mut session)?;
        if outputs.is_empty() {
            return Err(AutogradError::NoOutputs);
        }
        let output_nodes = outputs
            .iter()
            .map(|(&position, matrix)| Ok((position, session.resolve_argument(matrix)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        debug!(trace, expressions = session.expression_count(), "trace recorded");
        Ok(session.finish(input_nodes, output_nodes))
    }
}

/// Both traces must record the same operators in the same order.
fn check_trace_operations(previous: &TraceRecord, current: &TraceRecord) -> Result<()> {
    if previous.expressions.len() != current.expressions.len() {
        return Err(AutogradError::TraceMismatch(format!(
            "previous trace has {} expressions, current trace has {}",
            previous.expressions.len(),
            current.expressions.len()
        )));
    }
    for (position, (before, now)) in previous.expressions.iter().zip(&current.expressions).enumerate() {
        if before.name() != now.name() {
            return Err(AutogradError::TraceMismatch(format!(
                "expression {position} is {} in the previous trace and {} in the current trace",
                before.name(),
                now.name()
            )));
        }
    }
    Ok(())
}

/// Matching expressions of both traces must produce results of one shape.
fn check_trace_results(previous: &TraceRecord, current: &TraceRecord) -> Result<()> {
    for (position, (before, now)) in previous.expressions.iter().zip(&current.expressions).enumerate() {
        let before_shape = previous.register.arena().get(before.result())?.shape();
        let now_shape = current.register.arena().get(now.result())?.shape();
        if before_shape != now_shape {
            return Err(AutogradError::TraceMismatch(format!(
                "expression {position} ({}) yields {before_shape} in the previous trace and {now_shape} in the current trace",
                now.name()
            )));
        }
    }
    Ok(())
}

/// Expressions that contribute to the outputs, producers after consumers.
///
/// Discovery walks back from the outputs through producing expressions and
/// across cross-step links. Stop-gradient nodes end a walk. The collected
/// expressions run in descending creation order, which visits every consumer
/// of a node before its producer.
fn gradient_path(record: &TraceRecord) -> Result<Vec<usize>> {
    let arena = record.register.arena();
    let mut stack: Vec<NodeId> = record.outputs.values().copied().collect();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut chain: BTreeSet<usize> = BTreeSet::new();

    while let Some(node_id) = stack.pop() {
        if !visited.insert(node_id) {
            continue;
        }
        let node = arena.get(node_id)?;
        if node.is_stop_gradient() {
            continue;
        }
        if let Some(from) = node.from() {
            stack.push(from);
        }
        if let Some(&position) = record.producers.get(&node_id) {
            if chain.insert(position) {
                stack.extend(record.expressions[position].arguments());
            }
        }
    }
    Ok(chain.into_iter().rev().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session<'a>(config: &'a FactoryConfig, previous: Option<&'a HashMap<MatrixId, usize>>) -> TraceSession<'a> {
        TraceSession::new(CURRENT_TRACE, config, HashSet::new(), previous)
    }

    #[test]
    fn test_lock_cycle() {
        let config = FactoryConfig::strict(0);
        let mut session = session(&config, None);
        let lock = session.start_expression().unwrap().unwrap();
        assert!(matches!(
            session.start_expression(),
            Err(AutogradError::Reserved { holder }) if holder == lock
        ));
        assert!(matches!(
            session.end_expression(ExpressionLock(lock.0.wrapping_add(1))),
            Err(AutogradError::LockMismatch { .. })
        ));
        session.end_expression(lock).unwrap();
        assert!(session.start_expression().unwrap().is_some());
    }

    #[test]
    fn test_lenient_nested_operation_is_not_recorded() {
        let config = FactoryConfig::default();
        let mut session = session(&config, None);
        let a = Matrix::filled((2, 2), 1.0);
        let lock = session.start_expression().unwrap().unwrap();
        assert!(session.start_expression().unwrap().is_none());
        let nested = session.add(&a, &a).unwrap();
        assert_eq!(nested.to_vec(), vec![2.0; 4]);
        assert_eq!(session.expression_count(), 0);
        session.end_expression(lock).unwrap();
    }

    #[test]
    fn test_argument_resolution() {
        let config = FactoryConfig::default();
        let declared = Matrix::zeros((1, 1));
        let produced = Matrix::zeros((1, 1));
        let stranger = Matrix::zeros((1, 1));
        let previous = HashMap::from([(produced.id(), 4)]);
        let mut session = TraceSession::new(
            CURRENT_TRACE,
            &config,
            HashSet::from([declared.id()]),
            Some(&previous),
        );

        let kind = |session: &mut TraceSession<'_>, matrix: &Matrix| {
            let node = session.resolve_argument(matrix).unwrap();
            session.register.arena().get(node).unwrap().kind()
        };
        assert_eq!(kind(&mut session, &declared), NodeKind::Constant);
        assert_eq!(kind(&mut session, &produced), NodeKind::MultiIndex);
        assert_eq!(kind(&mut session, &stranger), NodeKind::Constant);
        assert_eq!(session.dependencies.len(), 1);
        assert_eq!(session.dependencies[0].0, 4);

        // A second reference reuses the node.
        let before = session.register.len();
        session.resolve_argument(&produced).unwrap();
        assert_eq!(session.register.len(), before);
        assert_eq!(session.dependencies.len(), 1);
    }

    #[test]
    fn test_aggregate_results_are_shared() {
        let config = FactoryConfig::default();
        let mut session = session(&config, None);
        let x = Matrix::zeros((2, 1));
        session.register.define(&x, NodeKind::MultiIndex, None);

        let mean = session.mean(&x, ReductionMode::Aggregate).unwrap();
        let scaled = session.mul(&mean, &Matrix::scalar(2.0)).unwrap();
        let mixed = session.sub(&x, &mean).unwrap();
        let arena = session.register.arena();
        let kind = |m: &Matrix| arena.get(session.register.node_of(m).unwrap()).unwrap().kind();
        assert_eq!(kind(&mean), NodeKind::Shared);
        assert_eq!(kind(&scaled), NodeKind::Shared);
        assert_eq!(kind(&mixed), NodeKind::MultiIndex);
    }

    #[test]
    fn test_gradient_path_skips_stop_gradient_branches() {
        let config = FactoryConfig::default();
        let mut session = session(&config, None);
        let x = Matrix::zeros((2, 1));
        let w = Matrix::filled((2, 1), 1.0);
        session.register.define(&x, NodeKind::MultiIndex, None);

        let frozen = session.mul(&x, &w).unwrap();
        let live = session.add(&x, &w).unwrap();
        let y = session.add(&frozen, &live).unwrap();
        session.register.mark_stop_gradient(&frozen).unwrap();
        let output = session.register.node_of(&y).unwrap();
        let record = session.finish(BTreeMap::new(), BTreeMap::from([(0, output)]));
        assert_eq!(gradient_path(&record).unwrap(), vec![2, 1]);
    }
}
