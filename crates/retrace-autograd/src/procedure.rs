//! Runtime for traced procedures.
//!
//! With cross-step dependencies the whole chain runs for one sample before
//! the next ("per-sample"). Without them each expression runs over every
//! sample before the next expression ("per-step").

use std::collections::{BTreeMap, BTreeSet};

use retrace_core::{JoinAxis, Matrix};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::AutogradError;
use crate::expression::{Expression, ReductionMode};
use crate::node::{Node, NodeArena, NodeId, NodeKind};
use crate::regularizer::Regularizer;
use crate::Result;

/// Matrices of one sample keyed by input or output position.
pub type Sample = BTreeMap<usize, Matrix>;

/// Samples keyed by sample index.
pub type Sequence = BTreeMap<usize, Sample>;

/// Granularity of a forward or backward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// The whole chain for one sample before the next.
    PerSample,
    /// One expression across every sample before the next expression.
    PerStep,
}

pub(crate) struct ProcedureParts {
    pub nodes: NodeArena,
    pub expressions: Vec<Box<dyn Expression>>,
    pub gradient_chain: Vec<usize>,
    pub inputs: BTreeMap<usize, NodeId>,
    pub outputs: BTreeMap<usize, NodeId>,
    pub parameters: Vec<(Matrix, NodeId)>,
    pub regularized: Vec<NodeId>,
    pub dependent_nodes: BTreeSet<NodeId>,
    pub reversed_input: bool,
    pub joined_input: bool,
}

/// An executable forward chain with its gradient chain.
#[derive(Debug)]
pub struct Procedure {
    nodes: NodeArena,
    expressions: Vec<Box<dyn Expression>>,
    gradient_chain: Vec<usize>,
    inputs: BTreeMap<usize, NodeId>,
    outputs: BTreeMap<usize, NodeId>,
    parameters: Vec<(Matrix, NodeId)>,
    regularized: Vec<NodeId>,
    regularizers: Vec<Box<dyn Regularizer>>,
    penalties: BTreeMap<NodeId, Matrix>,
    dependent_nodes: BTreeSet<NodeId>,
    reversed_input: bool,
    joined_input: bool,
    training: bool,
    mode: ExecutionMode,
}

impl Procedure {
    pub(crate) fn new(parts: ProcedureParts) -> Result<Self> {
        let mut procedure = Self {
            nodes: parts.nodes,
            expressions: parts.expressions,
            gradient_chain: parts.gradient_chain,
            inputs: parts.inputs,
            outputs: parts.outputs,
            parameters: parts.parameters,
            regularized: parts.regularized,
            regularizers: Vec::new(),
            penalties: BTreeMap::new(),
            dependent_nodes: parts.dependent_nodes,
            reversed_input: parts.reversed_input,
            joined_input: parts.joined_input,
            training: false,
            mode: ExecutionMode::PerStep,
        };
        if procedure.has_dependencies() {
            procedure.check_per_sample()?;
            procedure.mode = ExecutionMode::PerSample;
        }
        debug!(mode = ?procedure.mode, "execution mode");
        for line in procedure.describe_expression_chain() {
            trace!("{line}");
        }
        for line in procedure.describe_gradient_chain() {
            trace!("{line}");
        }
        Ok(procedure)
    }

    /// Per-sample execution cannot feed an aggregate result back into
    /// per-index expressions: the aggregate only exists after the last sample.
    fn check_per_sample(&self) -> Result<()> {
        for expression in &self.expressions {
            if self.is_single_step(expression.as_ref())? {
                continue;
            }
            for argument in expression.arguments() {
                if self.nodes.get(argument)?.kind() == NodeKind::Shared {
                    return Err(AutogradError::InvalidParameter(format!(
                        "{} reads an aggregate result and cannot run per sample",
                        expression.signature()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the result is a single shared slot, computed once per pass.
    fn is_single_step(&self, expression: &dyn Expression) -> Result<bool> {
        Ok(self.nodes.get(expression.result())?.kind() == NodeKind::Shared)
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependent_nodes.is_empty()
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Override the execution mode chosen at construction. Cross-step
    /// dependencies require per-sample execution.
    pub fn set_execution_mode(&mut self, mode: ExecutionMode) -> Result<()> {
        match mode {
            ExecutionMode::PerStep if self.has_dependencies() => {
                return Err(AutogradError::InvalidParameter(
                    "Procedure with cross-step dependencies must run per sample".to_string(),
                ));
            }
            ExecutionMode::PerSample => self.check_per_sample()?,
            ExecutionMode::PerStep => {}
        }
        debug!(?mode, "execution mode");
        self.mode = mode;
        Ok(())
    }

    pub fn dependent_nodes(&self) -> &BTreeSet<NodeId> {
        &self.dependent_nodes
    }

    pub fn nodes(&self) -> &NodeArena {
        &self.nodes
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id)
    }

    pub fn input_node(&self, position: usize) -> Result<NodeId> {
        self.inputs.get(&position).copied().ok_or(AutogradError::MissingInput(position))
    }

    pub fn output_node(&self, position: usize) -> Result<NodeId> {
        self.outputs.get(&position).copied().ok_or(AutogradError::MissingOutput(position))
    }

    pub fn expression_count(&self) -> usize {
        self.expressions.len()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Toggle training mode; dropout is active only while training.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for expression in &mut self.expressions {
            expression.set_training(training);
        }
    }

    /// Forward chain signatures in execution order.
    pub fn describe_expression_chain(&self) -> Vec<String> {
        self.expressions.iter().map(|e| e.signature()).collect()
    }

    /// Gradient chain rules in execution order.
    pub fn describe_gradient_chain(&self) -> Vec<String> {
        self.gradient_chain
            .iter()
            .map(|&position| self.expressions[position].gradient_signature())
            .collect()
    }

    // =========================================================================
    // Walk order
    // =========================================================================

    fn walk(&self, indices: impl Iterator<Item = usize>) -> Vec<usize> {
        let mut walk: Vec<usize> = indices.collect();
        walk.sort_unstable();
        if self.reversed_input {
            walk.reverse();
        }
        walk
    }

    /// Sample processed before `walk[k]`. The first sample looks at its raw
    /// neighbour so a sequence can continue from values kept by a reset.
    fn previous_index(&self, walk: &[usize], k: usize) -> Option<usize> {
        if k > 0 {
            return Some(walk[k - 1]);
        }
        let index = walk[k];
        if self.reversed_input {
            index.checked_add(1)
        } else {
            index.checked_sub(1)
        }
    }

    /// Sample processed after `walk[k]`, mirroring [`Self::previous_index`].
    fn next_index(&self, walk: &[usize], k: usize) -> Option<usize> {
        if let Some(&next) = walk.get(k + 1) {
            return Some(next);
        }
        let index = walk[k];
        if self.reversed_input {
            index.checked_sub(1)
        } else {
            index.checked_add(1)
        }
    }

    // =========================================================================
    // Forward
    // =========================================================================

    fn set_inputs(&mut self, index: usize, sample: &Sample) -> Result<()> {
        if self.joined_input {
            let node = self.input_node(0)?;
            let mut entries = sample.values();
            let first = entries.next().ok_or(AutogradError::MissingInput(0))?;
            let joined = entries.try_fold(first.clone(), |joined, next| joined.join(next, JoinAxis::Rows))?;
            self.nodes.get_mut(node)?.set_value(index, joined);
            return Ok(());
        }
        for (&position, &node) in &self.inputs {
            let matrix = sample.get(&position).ok_or(AutogradError::MissingInput(position))?;
            self.nodes.get_mut(node)?.set_value(index, matrix.clone());
        }
        Ok(())
    }

    fn forward_at(&mut self, position: usize, index: usize, last: usize) -> Result<()> {
        let single = self.is_single_step(self.expressions[position].as_ref())?;
        let expression = &mut self.expressions[position];
        if !single {
            return expression.calculate_forward(&mut self.nodes, index);
        }
        if index != last {
            return Ok(());
        }
        match expression.mode() {
            ReductionMode::Aggregate => expression.calculate_forward_aggregate(&mut self.nodes),
            ReductionMode::PerIndex => expression.calculate_forward(&mut self.nodes, index),
        }
    }

    /// Run the forward chain over `inputs` and return the outputs per sample.
    pub fn calculate_expression(&mut self, inputs: &Sequence) -> Result<Sequence> {
        let walk = self.walk(inputs.keys().copied());
        let Some(&last) = walk.last() else {
            return Ok(Sequence::new());
        };
        for (&index, sample) in inputs {
            self.set_inputs(index, sample)?;
        }
        self.forward_regularize()?;

        if self.mode == ExecutionMode::PerSample {
            for k in 0..walk.len() {
                let index = walk[k];
                let previous = self.previous_index(&walk, k);
                for &node in &self.dependent_nodes {
                    self.nodes.update_value_dependency(node, index, previous)?;
                }
                trace!(index, "forward sample");
                for position in 0..self.expressions.len() {
                    self.forward_at(position, index, last)?;
                }
            }
        } else {
            for position in 0..self.expressions.len() {
                for &index in &walk {
                    self.forward_at(position, index, last)?;
                }
            }
        }

        let mut outputs = Sequence::new();
        for &index in &walk {
            let mut sample = Sample::new();
            for (&position, &node) in &self.outputs {
                let value = self
                    .nodes
                    .get(node)?
                    .value(index)
                    .cloned()
                    .ok_or(AutogradError::MissingOutput(position))?;
                sample.insert(position, value);
            }
            outputs.insert(index, sample);
        }
        Ok(outputs)
    }

    /// Forward pass for one sample at `index`.
    pub fn calculate_expression_single(&mut self, inputs: &Sample, index: usize) -> Result<Sample> {
        let sequence = Sequence::from([(index, inputs.clone())]);
        let mut outputs = self.calculate_expression(&sequence)?;
        Ok(outputs.remove(&index).unwrap_or_default())
    }

    // =========================================================================
    // Backward
    // =========================================================================

    fn backward_at(&mut self, position: usize, index: usize, first: usize, next: Option<usize>) -> Result<()> {
        let single = self.is_single_step(self.expressions[position].as_ref())?;
        if single && index != first {
            return Ok(());
        }
        let expression = &mut self.expressions[position];
        self.nodes.update_gradient_dependency(expression.result(), index, next)?;
        if single && expression.mode() == ReductionMode::Aggregate {
            expression.calculate_backward_aggregate(&mut self.nodes)
        } else {
            expression.calculate_backward(&mut self.nodes, index)
        }
    }

    /// Propagate `output_gradients` back through the gradient chain.
    ///
    /// Samples are processed latest first. With `steps > 0` only the latest
    /// `steps` samples are processed (truncated backpropagation through time).
    /// An aggregate output receives the sum of its processed gradients.
    /// Returns the input gradients of the processed samples.
    pub fn calculate_gradient(&mut self, output_gradients: &Sequence, steps: usize) -> Result<Sequence> {
        let walk = self.walk(output_gradients.keys().copied());
        let take = if steps == 0 { walk.len() } else { steps.min(walk.len()) };
        // Positions in `walk`, latest sample first.
        let processed: Vec<usize> = (walk.len() - take..walk.len()).rev().collect();
        let Some(first) = processed.first().map(|&k| walk[k]) else {
            return Ok(Sequence::new());
        };

        // A shared output has one slot for every index; it receives the sum.
        let mut seeded = BTreeSet::new();
        for &k in &processed {
            let index = walk[k];
            for (&position, gradient) in &output_gradients[&index] {
                let id = self.output_node(position)?;
                let node = self.nodes.get_mut(id)?;
                if node.kind() == NodeKind::Shared && !seeded.insert(id) {
                    let total = node.gradient_or_empty(index).add(gradient)?;
                    node.set_gradient(index, total);
                } else {
                    node.set_gradient(index, gradient.clone());
                }
            }
        }

        if self.mode == ExecutionMode::PerSample {
            for &k in &processed {
                let index = walk[k];
                let next = self.next_index(&walk, k);
                trace!(index, "backward sample");
                for chain_position in 0..self.gradient_chain.len() {
                    let position = self.gradient_chain[chain_position];
                    self.backward_at(position, index, first, next)?;
                }
            }
        } else {
            for chain_position in 0..self.gradient_chain.len() {
                let position = self.gradient_chain[chain_position];
                for &k in &processed {
                    self.backward_at(position, walk[k], first, None)?;
                }
            }
        }

        self.backward_regularize()?;

        let mut gradients = Sequence::new();
        for &k in &processed {
            let index = walk[k];
            let mut sample = Sample::new();
            for (&position, &node) in &self.inputs {
                sample.insert(position, self.nodes.get(node)?.gradient_or_empty(index));
            }
            gradients.insert(index, sample);
        }
        Ok(gradients)
    }

    /// Backward pass for one sample at `index`.
    pub fn calculate_gradient_single(&mut self, output_gradients: &Sample, index: usize) -> Result<Sample> {
        let sequence = Sequence::from([(index, output_gradients.clone())]);
        let mut gradients = self.calculate_gradient(&sequence, 0)?;
        Ok(gradients.remove(&index).unwrap_or_default())
    }

    // =========================================================================
    // State
    // =========================================================================

    /// Clear per-sample values, gradients and expression side state.
    ///
    /// With `keep_dependent` the values of nodes feeding the next step
    /// survive so a following call can continue the sequence.
    pub fn reset(&mut self, keep_dependent: bool) {
        for node in self.nodes.iter_mut() {
            node.reset(keep_dependent);
        }
        for expression in &mut self.expressions {
            expression.reset();
        }
        self.penalties.clear();
    }

    pub fn store_dependencies(&mut self, backup: usize) {
        for node in self.nodes.iter_mut() {
            node.store_dependency(backup);
        }
    }

    pub fn restore_dependencies(&mut self, backup: usize) {
        for node in self.nodes.iter_mut() {
            node.restore_dependency(backup);
        }
    }

    /// Node holding the gradients of a trainable parameter.
    pub fn parameter_node(&self, parameter: &Matrix) -> Result<NodeId> {
        self.parameters
            .iter()
            .find(|(matrix, _)| matrix.id() == parameter.id())
            .map(|(_, node)| *node)
            .ok_or(AutogradError::UnregisteredMatrix(parameter.id()))
    }

    fn parameter_gradient(&self, node: NodeId) -> Result<Matrix> {
        let mean = self.nodes.get(node)?.gradient_mean()?;
        match self.penalties.get(&node) {
            Some(penalty) => Ok(mean.add(penalty)?),
            None => Ok(mean),
        }
    }

    /// Mean gradient of a parameter over the samples that contributed to it,
    /// plus the penalty gradient of the last backward pass.
    pub fn gradient(&self, parameter: &Matrix) -> Result<Matrix> {
        self.parameter_gradient(self.parameter_node(parameter)?)
    }

    /// `(parameter, gradient)` for every trainable parameter.
    pub fn gradients(&self) -> Result<Vec<(Matrix, Matrix)>> {
        self.parameters
            .iter()
            .map(|(matrix, node)| Ok((matrix.clone(), self.parameter_gradient(*node)?)))
            .collect()
    }

    // =========================================================================
    // Regularization
    // =========================================================================

    /// Replace the regularizers applied to the regularized parameters.
    pub fn set_regularizers(&mut self, regularizers: Vec<Box<dyn Regularizer>>) {
        debug!(
            regularizers = ?regularizers.iter().map(|r| r.name()).collect::<Vec<_>>(),
            parameters = self.regularized.len(),
            "regularizers set"
        );
        self.regularizers = regularizers;
        self.penalties.clear();
    }

    /// Regularized parameters that still receive gradients.
    fn regularized_parameters(&self) -> impl Iterator<Item = Result<&Matrix>> + '_ {
        self.regularized.iter().filter_map(|&id| match self.nodes.get(id) {
            Ok(node) if node.is_stop_gradient() => None,
            Ok(node) => Some(Ok(node.reference())),
            Err(err) => Some(Err(err)),
        })
    }

    fn forward_regularize(&mut self) -> Result<()> {
        if self.regularizers.is_empty() {
            return Ok(());
        }
        let parameters = self.regularized_parameters().map(|p| p.cloned()).collect::<Result<Vec<_>>>()?;
        for parameter in &parameters {
            for regularizer in &mut self.regularizers {
                regularizer.forward(parameter)?;
            }
        }
        Ok(())
    }

    fn backward_regularize(&mut self) -> Result<()> {
        self.penalties.clear();
        if self.regularizers.is_empty() {
            return Ok(());
        }
        for &id in &self.regularized {
            let node = self.nodes.get(id)?;
            if node.is_stop_gradient() {
                continue;
            }
            let parameter = node.reference();
            let mut penalty = parameter.zeros_like();
            for regularizer in &mut self.regularizers {
                penalty = penalty.add(&regularizer.backward(parameter)?)?;
            }
            self.penalties.insert(id, penalty);
        }
        Ok(())
    }

    /// Total penalty of every regularizer over the regularized parameters.
    pub fn regularization_error(&self) -> Result<f64> {
        let mut error = 0.0;
        for parameter in self.regularized_parameters() {
            let parameter = parameter?;
            for regularizer in &self.regularizers {
                error += regularizer.error(parameter)?;
            }
        }
        Ok(error)
    }
}
