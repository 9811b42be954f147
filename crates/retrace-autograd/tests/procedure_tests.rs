//! Runtime behaviour of built procedures.

mod common;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use common::*;
use retrace_autograd::prelude::*;

fn random_sequence(len: usize, shape: (usize, usize), seed: u64) -> Sequence {
    let mut rng = rng(seed);
    sequence((0..len).map(|_| Matrix::randn_with(shape, &mut rng)).collect())
}

fn ones_sequence(len: usize, shape: (usize, usize)) -> Sequence {
    sequence((0..len).map(|_| Matrix::filled(shape, 1.0)).collect())
}

fn flatten_gradients(gradients: &[(Matrix, Matrix)]) -> Vec<Vec<f64>> {
    gradients.iter().map(|(_, gradient)| gradient.to_vec()).collect()
}

// ============================================================================
// Recurrence
// ============================================================================

#[test]
fn test_recurrent_outputs_match_unrolled_states() {
    let mut definition = Recurrent::new(21);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    assert_eq!(procedure.dependent_nodes().len(), 2);

    let inputs = random_sequence(6, (2, 1), 22);
    let outputs = procedure.calculate_expression(&inputs).unwrap();
    let expected = definition.unrolled(&inputs.values().map(|s| s[&0].clone()).collect::<Vec<_>>());
    for (index, state) in expected.iter().enumerate() {
        assert_abs_diff_eq!(outputs[&index][&0].max_abs_diff(state).unwrap(), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_reversed_input_walks_descending() {
    let mut definition = Recurrent::new(23);
    definition.reversed = true;
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();

    let inputs = random_sequence(5, (2, 1), 24);
    let outputs = procedure.calculate_expression(&inputs).unwrap();
    let expected = definition.unrolled(&inputs.values().map(|s| s[&0].clone()).collect::<Vec<_>>());
    for (index, state) in expected.iter().enumerate() {
        assert_abs_diff_eq!(outputs[&index][&0].max_abs_diff(state).unwrap(), 0.0, epsilon = 1e-12);
    }
}

#[test]
fn test_single_sample_calls_continue_the_sequence() {
    let mut definition = Recurrent::new(25);
    let mut stepwise = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let mut batched = ProcedureFactory::default().get_procedure(&mut definition).unwrap();

    let inputs = random_sequence(4, (2, 1), 26);
    let expected = batched.calculate_expression(&inputs).unwrap();
    for (&index, sample) in &inputs {
        let output = stepwise.calculate_expression_single(sample, index).unwrap();
        assert_eq!(output[&0].to_vec(), expected[&index][&0].to_vec());
    }

    let gradients = ones_sequence(4, (3, 1));
    batched.calculate_gradient(&gradients, 0).unwrap();
    for (&index, sample) in gradients.iter().rev() {
        stepwise.calculate_gradient_single(sample, index).unwrap();
    }
    assert_eq!(
        flatten_gradients(&stepwise.gradients().unwrap()),
        flatten_gradients(&batched.gradients().unwrap())
    );
}

#[test]
fn test_reset_keeping_dependent_values_continues_sequence() {
    let mut definition = Recurrent::new(27);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();

    let inputs = random_sequence(6, (2, 1), 28);
    let expected = procedure.calculate_expression(&inputs).unwrap();
    procedure.reset(false);

    let first: Sequence = inputs.range(..3).map(|(k, v)| (*k, v.clone())).collect();
    let second: Sequence = inputs.range(3..).map(|(k, v)| (*k, v.clone())).collect();
    procedure.calculate_expression(&first).unwrap();
    procedure.reset(true);
    let outputs = procedure.calculate_expression(&second).unwrap();
    for index in 3..6 {
        assert_eq!(outputs[&index][&0].to_vec(), expected[&index][&0].to_vec());
    }
}

#[test]
fn test_store_and_restore_dependencies() {
    let mut definition = Recurrent::new(29);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = random_sequence(3, (2, 1), 30);
    let reference = procedure.calculate_expression(&inputs).unwrap();

    procedure.store_dependencies(1);
    let other = random_sequence(3, (2, 1), 31);
    procedure.calculate_expression(&other).unwrap();
    procedure.restore_dependencies(1);

    let output = procedure.output_node(0).unwrap();
    let node = procedure.node(output).unwrap();
    for index in 0..3 {
        assert_eq!(node.value(index).unwrap().to_vec(), reference[&index][&0].to_vec());
    }
}

// ============================================================================
// Determinism and reset
// ============================================================================

#[test]
fn test_reset_is_idempotent_between_passes() {
    let mut definition = Recurrent::new(32);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = random_sequence(5, (2, 1), 33);
    let output_gradients = random_sequence(5, (3, 1), 34);

    let mut runs = Vec::new();
    for _ in 0..3 {
        procedure.reset(false);
        let outputs = procedure.calculate_expression(&inputs).unwrap();
        let input_gradients = procedure.calculate_gradient(&output_gradients, 0).unwrap();
        runs.push((
            values(&outputs),
            values(&input_gradients),
            flatten_gradients(&procedure.gradients().unwrap()),
        ));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[1], runs[2]);
}

#[test]
fn test_dependency_discovery_is_deterministic() {
    let build = || {
        let mut definition = Recurrent::new(35);
        let procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
        (
            procedure.describe_expression_chain(),
            procedure.describe_gradient_chain(),
            procedure.dependent_nodes().clone(),
        )
    };
    assert_eq!(build(), build());
}

#[test]
fn test_per_sample_and_per_step_are_bit_identical() {
    let mut definition = Affine::new(36);
    let mut per_step = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let mut per_sample = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    per_sample.set_execution_mode(ExecutionMode::PerSample).unwrap();
    assert_eq!(per_step.execution_mode(), ExecutionMode::PerStep);

    let inputs = random_sequence(7, (3, 1), 37);
    let output_gradients = random_sequence(7, (2, 1), 38);
    assert_eq!(
        values(&per_step.calculate_expression(&inputs).unwrap()),
        values(&per_sample.calculate_expression(&inputs).unwrap())
    );
    assert_eq!(
        values(&per_step.calculate_gradient(&output_gradients, 0).unwrap()),
        values(&per_sample.calculate_gradient(&output_gradients, 0).unwrap())
    );
    assert_eq!(
        flatten_gradients(&per_step.gradients().unwrap()),
        flatten_gradients(&per_sample.gradients().unwrap())
    );
}

#[test]
fn test_recurrent_procedure_refuses_per_step() {
    let mut definition = Recurrent::new(39);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    assert!(matches!(
        procedure.set_execution_mode(ExecutionMode::PerStep),
        Err(AutogradError::InvalidParameter(_))
    ));
    assert_eq!(procedure.execution_mode(), ExecutionMode::PerSample);
}

// ============================================================================
// Truncated backpropagation
// ============================================================================

#[test]
fn test_truncated_gradient_touches_latest_samples_only() {
    let mut definition = Recurrent::new(40);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = random_sequence(10, (2, 1), 41);
    procedure.calculate_expression(&inputs).unwrap();

    let gradients = procedure.calculate_gradient(&ones_sequence(10, (3, 1)), 3).unwrap();
    assert_eq!(gradients.keys().copied().collect::<Vec<_>>(), vec![7, 8, 9]);

    let input = procedure.node(procedure.input_node(0).unwrap()).unwrap();
    for index in 0..7 {
        assert!(input.gradient(index).is_none(), "index {index} was touched");
    }
    for index in 7..10 {
        assert!(input.gradient(index).is_some());
    }
    let weight = procedure.parameter_node(&definition.input_weight).unwrap();
    assert_eq!(procedure.node(weight).unwrap().entry_count(), 3);
}

#[test]
fn test_truncated_per_step_gradient() {
    let mut definition = Affine::new(42);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = random_sequence(10, (3, 1), 43);
    procedure.calculate_expression(&inputs).unwrap();
    let gradients = procedure.calculate_gradient(&ones_sequence(10, (2, 1)), 4).unwrap();
    assert_eq!(gradients.keys().copied().collect::<Vec<_>>(), vec![6, 7, 8, 9]);
}

// ============================================================================
// Parameters
// ============================================================================

#[test]
fn test_every_parameter_has_a_gradient() {
    let mut definition = Recurrent::new(44);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    procedure.calculate_expression(&random_sequence(3, (2, 1), 45)).unwrap();
    procedure.calculate_gradient(&ones_sequence(3, (3, 1)), 0).unwrap();

    let gradients = procedure.gradients().unwrap();
    assert_eq!(gradients.len(), 2);
    for ((matrix, gradient), parameter) in gradients.iter().zip(definition.parameter_matrices()) {
        assert!(matrix.same_allocation(&parameter));
        assert_eq!(gradient.shape(), parameter.shape());
    }
}

#[test]
fn test_unknown_matrix_has_no_gradient() {
    let mut definition = Affine::new(46);
    let procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let err = procedure.gradient(&Matrix::zeros((2, 3))).unwrap_err();
    assert!(matches!(err, AutogradError::UnregisteredMatrix(_)));
    assert!(err.to_string().starts_with("No such reference matrix registered"));
}

// ============================================================================
// Pooling, aggregate outputs, joined input
// ============================================================================

struct Pooled {
    input: Matrix,
}

impl ForwardProcedure for Pooled {
    fn input_matrices(&mut self, _reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let pooled = session.max_pool(&self.input, PoolParams::new(2, 2).with_stride(2))?;
        outputs([(0, pooled)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }
}

#[test]
fn test_max_pool_routes_gradient_to_winners() {
    let mut definition = Pooled {
        input: Matrix::zeros((4, 4)),
    };
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let input = Matrix::from_rows(&[
        &[1.0, 9.0, 2.0, 3.0],
        &[4.0, 0.0, 5.0, 11.0],
        &[13.0, 6.0, 7.0, 8.0],
        &[10.0, 12.0, 15.0, 14.0],
    ])
    .unwrap();
    let outputs = procedure.calculate_expression(&sequence(vec![input])).unwrap();
    assert_eq!(outputs[&0][&0].to_vec(), vec![9.0, 11.0, 13.0, 15.0]);

    let gradients = procedure.calculate_gradient(&ones_sequence(1, (2, 2)), 0).unwrap();
    let routed = gradients[&0][&0].to_vec();
    for (position, value) in routed.iter().enumerate() {
        let expected = if [1, 7, 8, 14].contains(&position) { 1.0 } else { 0.0 };
        assert_eq!(*value, expected, "position {position}");
    }
}

struct Averaged {
    input: Matrix,
}

impl ForwardProcedure for Averaged {
    fn input_matrices(&mut self, _reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let mean = session.mean(&self.input, ReductionMode::Aggregate)?;
        outputs([(0, mean)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }
}

#[test]
fn test_aggregate_output_is_shared_by_every_index() {
    let mut definition = Averaged {
        input: Matrix::zeros((2, 1)),
    };
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = sequence(vec![
        Matrix::column(&[1.0, 2.0]),
        Matrix::column(&[3.0, 4.0]),
        Matrix::column(&[5.0, 9.0]),
    ]);
    let outputs = procedure.calculate_expression(&inputs).unwrap();
    for index in 0..3 {
        assert_eq!(outputs[&index][&0].to_vec(), vec![3.0, 5.0]);
    }

    let output_gradients = sequence(vec![
        Matrix::filled((2, 1), 1.0),
        Matrix::filled((2, 1), 2.0),
        Matrix::filled((2, 1), 3.0),
    ]);
    let gradients = procedure.calculate_gradient(&output_gradients, 0).unwrap();
    for index in 0..3 {
        for value in gradients[&index][&0].to_vec() {
            assert_abs_diff_eq!(value, 2.0, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_truncated_aggregate_output_sums_processed_gradients() {
    let mut definition = Averaged {
        input: Matrix::zeros((1, 1)),
    };
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = sequence((0..4).map(|i| Matrix::scalar(f64::from(i))).collect());
    procedure.calculate_expression(&inputs).unwrap();

    let output_gradients = sequence((1..=4).map(|i| Matrix::scalar(f64::from(i))).collect());
    let gradients = procedure.calculate_gradient(&output_gradients, 2).unwrap();
    assert_eq!(gradients.keys().copied().collect::<Vec<_>>(), vec![2, 3]);
    let output = procedure.output_node(0).unwrap();
    assert_eq!(procedure.node(output).unwrap().gradient(0).unwrap().value(), 7.0);
    for index in [2, 3] {
        assert_abs_diff_eq!(gradients[&index][&0].value(), 7.0 / 4.0, epsilon = 1e-12);
    }
}

struct Joined {
    input: Matrix,
}

impl ForwardProcedure for Joined {
    fn input_matrices(&mut self, _reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let total = session.sum(&self.input, ReductionMode::PerIndex)?;
        outputs([(0, total)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }

    fn joined_input(&self) -> bool {
        true
    }
}

#[test]
fn test_joined_input_stacks_sample_entries() {
    let mut definition = Joined {
        input: Matrix::zeros((4, 1)),
    };
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = Sequence::from([(
        0,
        Sample::from([(0, Matrix::column(&[1.0, 2.0])), (1, Matrix::column(&[3.0, 4.0]))]),
    )]);
    let outputs = procedure.calculate_expression(&inputs).unwrap();
    assert_eq!(outputs[&0][&0].value(), 10.0);

    let input = procedure.node(procedure.input_node(0).unwrap()).unwrap();
    assert_eq!(input.value(0).unwrap().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_missing_input_is_reported() {
    let mut definition = Affine::new(47);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let inputs = Sequence::from([(0, Sample::from([(3, Matrix::zeros((3, 1)))]))]);
    assert!(matches!(
        procedure.calculate_expression(&inputs),
        Err(AutogradError::MissingInput(0))
    ));
}

#[test]
fn test_empty_sequence_is_a_no_op() {
    let mut definition = Affine::new(48);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    assert!(procedure.calculate_expression(&Sequence::new()).unwrap().is_empty());
    assert!(procedure.calculate_gradient(&Sequence::new(), 0).unwrap().is_empty());
}

// ============================================================================
// Training mode
// ============================================================================

struct Dropped {
    input: Matrix,
}

impl ForwardProcedure for Dropped {
    fn input_matrices(&mut self, _reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let dropped = session.dropout(&self.input, 0.5, false)?;
        outputs([(0, dropped)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        Vec::new()
    }
}

#[test]
fn test_dropout_follows_training_mode() {
    let mut definition = Dropped {
        input: Matrix::zeros((6, 6)),
    };
    let factory = ProcedureFactory::new(FactoryConfig::default().with_seed(49));
    let mut procedure = factory.get_procedure(&mut definition).unwrap();
    let inputs = ones_sequence(1, (6, 6));

    let outputs = procedure.calculate_expression(&inputs).unwrap();
    assert!(outputs[&0][&0].to_vec().iter().all(|&v| v == 1.0));

    procedure.set_training(true);
    assert!(procedure.is_training());
    procedure.reset(false);
    let outputs = procedure.calculate_expression(&inputs).unwrap();
    let values = outputs[&0][&0].to_vec();
    assert!(values.iter().all(|&v| v == 0.0 || v == 2.0));
    assert!(values.iter().any(|&v| v == 0.0));
}

// ============================================================================
// Regularization
// ============================================================================

/// [`Affine`] with an explicit set of regularized parameters.
struct Penalized {
    inner: Affine,
    regularized: Vec<Matrix>,
}

impl ForwardProcedure for Penalized {
    fn input_matrices(&mut self, reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        self.inner.input_matrices(reset_previous)
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        self.inner.forward_procedure(session)
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        self.inner.parameter_matrices()
    }

    fn regularized_matrices(&self) -> Vec<Matrix> {
        self.regularized.clone()
    }
}

#[derive(Debug, Default)]
struct Counting {
    forwards: Arc<AtomicUsize>,
    backwards: Arc<AtomicUsize>,
}

impl Regularizer for Counting {
    fn forward(&mut self, _parameter: &Matrix) -> Result<()> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn error(&self, _parameter: &Matrix) -> Result<f64> {
        Ok(1.0)
    }

    fn backward(&mut self, parameter: &Matrix) -> Result<Matrix> {
        self.backwards.fetch_add(1, Ordering::SeqCst);
        Ok(parameter.zeros_like())
    }

    fn name(&self) -> &'static str {
        "COUNTING"
    }
}

#[test]
fn test_l2_penalty_adds_to_parameter_gradients() {
    let mut definition = Affine::new(13);
    let factory = ProcedureFactory::default();
    let mut plain = factory.get_procedure(&mut definition).unwrap();
    let mut penalized = factory.get_procedure(&mut definition).unwrap();
    penalized.set_regularizers(vec![Box::new(L2::new(0.1).unwrap())]);

    let inputs = random_sequence(4, (3, 1), 14);
    let weights = random_sequence(4, (2, 1), 15);
    for procedure in [&mut plain, &mut penalized] {
        procedure.calculate_expression(&inputs).unwrap();
        procedure.calculate_gradient(&weights, 0).unwrap();
    }

    for parameter in [&definition.weight, &definition.bias] {
        let base = plain.gradient(parameter).unwrap().to_vec();
        let total = penalized.gradient(parameter).unwrap().to_vec();
        for ((b, t), w) in base.iter().zip(&total).zip(parameter.to_vec()) {
            assert_abs_diff_eq!(*t, b + 0.2 * w, epsilon = 1e-12);
        }
    }

    let squares = definition.weight.power(2.0).sum_value() + definition.bias.power(2.0).sum_value();
    assert_abs_diff_eq!(penalized.regularization_error().unwrap(), 0.1 * squares, epsilon = 1e-12);
    assert_eq!(plain.regularization_error().unwrap(), 0.0);

    penalized.reset(false);
    assert!(penalized.gradient(&definition.weight).unwrap().to_vec().iter().all(|&v| v == 0.0));
}

#[test]
fn test_regularizer_hooks_run_once_per_pass() {
    let mut definition = Affine::new(16);
    let mut procedure = ProcedureFactory::default().get_procedure(&mut definition).unwrap();
    let counting = Counting::default();
    let (forwards, backwards) = (counting.forwards.clone(), counting.backwards.clone());
    procedure.set_regularizers(vec![Box::new(counting)]);

    procedure.calculate_expression(&random_sequence(5, (3, 1), 17)).unwrap();
    procedure.calculate_gradient(&ones_sequence(5, (2, 1)), 2).unwrap();
    // One call per regularized parameter per pass, however many samples.
    assert_eq!(forwards.load(Ordering::SeqCst), 2);
    assert_eq!(backwards.load(Ordering::SeqCst), 2);
    assert_eq!(procedure.regularization_error().unwrap(), 2.0);
}

#[test]
fn test_only_declared_parameters_are_regularized() {
    let inner = Affine::new(18);
    let (weight, bias) = (inner.weight.clone(), inner.bias.clone());
    let mut definition = Penalized {
        inner,
        regularized: vec![weight.clone()],
    };
    let factory = ProcedureFactory::default();
    let mut plain = factory.get_procedure(&mut definition.inner).unwrap();
    let mut penalized = factory.get_procedure(&mut definition).unwrap();
    penalized.set_regularizers(vec![Box::new(L1::new(0.5).unwrap())]);

    let inputs = random_sequence(3, (3, 1), 19);
    let weights = random_sequence(3, (2, 1), 20);
    for procedure in [&mut plain, &mut penalized] {
        procedure.calculate_expression(&inputs).unwrap();
        procedure.calculate_gradient(&weights, 0).unwrap();
    }
    assert_eq!(plain.gradient(&bias).unwrap().to_vec(), penalized.gradient(&bias).unwrap().to_vec());
    assert_abs_diff_eq!(
        penalized.regularization_error().unwrap(),
        0.5 * weight.abs().sum_value(),
        epsilon = 1e-12
    );

    definition.regularized = vec![Matrix::zeros((2, 3))];
    let err = factory.get_procedure(&mut definition).unwrap_err();
    assert!(matches!(err, AutogradError::UnregisteredMatrix(_)));
}
