//! Forward procedure definitions and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use retrace_autograd::prelude::*;

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn outputs(entries: impl IntoIterator<Item = (usize, Matrix)>) -> Result<BTreeMap<usize, Matrix>> {
    Ok(entries.into_iter().collect())
}

/// One-entry samples at indices `0..values.len()`.
pub fn sequence(values: Vec<Matrix>) -> Sequence {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| (index, Sample::from([(0, value)])))
        .collect()
}

/// Plain values of every entry, for exact comparisons.
pub fn values(sequence: &Sequence) -> BTreeMap<usize, BTreeMap<usize, Vec<f64>>> {
    sequence
        .iter()
        .map(|(&index, sample)| {
            let entries = sample.iter().map(|(&position, m)| (position, m.to_vec())).collect();
            (index, entries)
        })
        .collect()
}

/// `y = sigmoid(W · x + b)`.
pub struct Affine {
    pub input: Matrix,
    pub weight: Matrix,
    pub bias: Matrix,
}

impl Affine {
    pub fn new(seed: u64) -> Self {
        let mut rng = rng(seed);
        Self {
            input: Matrix::zeros((3, 1)),
            weight: Matrix::randn_with((2, 3), &mut rng),
            bias: Matrix::randn_with((2, 1), &mut rng),
        }
    }
}

impl ForwardProcedure for Affine {
    fn input_matrices(&mut self, _reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let z = session.dot(&self.weight, &self.input)?;
        let z = session.add(&z, &self.bias)?;
        let y = session.unary(&z, UnaryFunction::Sigmoid)?;
        outputs([(0, y)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// `h_t = tanh(Wx · x_t + Wh · h_{t-1})` with `h_{-1} = 0`.
pub struct Recurrent {
    pub input: Matrix,
    pub state: Matrix,
    pub input_weight: Matrix,
    pub state_weight: Matrix,
    pub reversed: bool,
}

impl Recurrent {
    pub fn new(seed: u64) -> Self {
        let mut rng = rng(seed);
        Self {
            input: Matrix::zeros((2, 1)),
            state: Matrix::zeros((3, 1)),
            input_weight: Matrix::randn_with((3, 2), &mut rng).mul_scalar(0.5),
            state_weight: Matrix::randn_with((3, 3), &mut rng).mul_scalar(0.5),
            reversed: false,
        }
    }

    /// Hidden states computed directly with matrix operations, in walk order.
    pub fn unrolled(&self, inputs: &[Matrix]) -> Vec<Matrix> {
        let mut order: Vec<usize> = (0..inputs.len()).collect();
        if self.reversed {
            order.reverse();
        }
        let mut states = vec![Matrix::zeros((3, 1)); inputs.len()];
        let mut state = Matrix::zeros((3, 1));
        for index in order {
            let a = self.input_weight.dot(&inputs[index]).unwrap();
            let b = self.state_weight.dot(&state).unwrap();
            state = UnaryFunction::Tanh.apply(&a.add(&b).unwrap());
            states[index] = state.clone();
        }
        states
    }
}

impl ForwardProcedure for Recurrent {
    fn input_matrices(&mut self, reset_previous: bool) -> Result<BTreeMap<usize, Matrix>> {
        if reset_previous {
            self.state = Matrix::zeros((3, 1));
        }
        outputs([(0, self.input.clone())])
    }

    fn forward_procedure(&mut self, session: &mut TraceSession<'_>) -> Result<BTreeMap<usize, Matrix>> {
        let a = session.dot(&self.input_weight, &self.input)?;
        let b = session.dot(&self.state_weight, &self.state)?;
        let s = session.add(&a, &b)?;
        let h = session.unary(&s, UnaryFunction::Tanh)?;
        self.state = h.clone();
        outputs([(0, h)])
    }

    fn parameter_matrices(&self) -> Vec<Matrix> {
        vec![self.input_weight.clone(), self.state_weight.clone()]
    }

    fn reversed_input(&self) -> bool {
        self.reversed
    }
}

/// Mean over samples of `Σ (output_t ⊙ weights_t)` for output 0.
pub fn weighted_objective(procedure: &mut Procedure, inputs: &Sequence, weights: &Sequence) -> f64 {
    procedure.reset(false);
    let outputs = procedure.calculate_expression(inputs).unwrap();
    let total: f64 = outputs
        .iter()
        .map(|(index, sample)| sample[&0].mul(&weights[index][&0]).unwrap().sum_value())
        .sum();
    total / outputs.len() as f64
}

/// Central finite differences of [`weighted_objective`] for every cell of `parameter`.
pub fn numerical_gradient(
    procedure: &mut Procedure,
    parameter: &Matrix,
    inputs: &Sequence,
    weights: &Sequence,
    eps: f64,
) -> Vec<f64> {
    (0..parameter.size())
        .map(|i| {
            parameter.update(|data| data[i] += eps);
            let plus = weighted_objective(procedure, inputs, weights);
            parameter.update(|data| data[i] -= 2.0 * eps);
            let minus = weighted_objective(procedure, inputs, weights);
            parameter.update(|data| data[i] += eps);
            (plus - minus) / (2.0 * eps)
        })
        .collect()
}

/// Mean parameter gradient after one forward and one full backward pass.
pub fn analytic_gradient(
    procedure: &mut Procedure,
    parameter: &Matrix,
    inputs: &Sequence,
    weights: &Sequence,
) -> Vec<f64> {
    procedure.reset(false);
    procedure.calculate_expression(inputs).unwrap();
    procedure.calculate_gradient(weights, 0).unwrap();
    procedure.gradient(parameter).unwrap().to_vec()
}

pub fn assert_close(analytic: &[f64], numerical: &[f64], tol: f64, name: &str) {
    assert_eq!(analytic.len(), numerical.len(), "{name}: length mismatch");
    for (i, (a, n)) in analytic.iter().zip(numerical).enumerate() {
        assert!(
            (a - n).abs() < tol,
            "{name}[{i}]: analytic={a:.8}, numerical={n:.8}"
        );
    }
}
