//! Public matrix API exercised the way the autodiff engine uses it.

use approx::assert_abs_diff_eq;
use retrace_core::prelude::*;

fn assert_close(a: &[f64], b: &[f64], tol: f64) {
    assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "element {} differs: {} vs {} (tol={})", i, x, y, tol);
    }
}

// ============================================================================
// Identity
// ============================================================================

#[test]
fn test_clones_share_identity_and_storage() {
    let a = Matrix::zeros((2, 2));
    let b = a.clone();
    b.set(1, 1, 0, 4.0).unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(a.get(1, 1), 4.0);

    let c = a.deep_copy();
    assert_ne!(c.id(), a.id());
    c.set(0, 0, 0, 1.0).unwrap();
    assert_eq!(a.get(0, 0), 0.0);
}

#[test]
fn test_every_result_is_a_new_matrix() {
    let a = Matrix::filled((2, 2), 1.0);
    let results = [
        a.add(&a).unwrap(),
        a.transpose(),
        a.flatten(),
        a.sum(),
        a.mul_scalar(2.0),
    ];
    for result in &results {
        assert!(!result.same_allocation(&a));
    }
}

// ============================================================================
// Structure
// ============================================================================

#[test]
fn test_join_then_unjoin_recovers_blocks() {
    let a = Matrix::from_rows(&[&[1.0, 2.0]]).unwrap();
    let b = Matrix::from_rows(&[&[3.0, 4.0], &[5.0, 6.0]]).unwrap();
    let joined = a.join(&b, JoinAxis::Rows).unwrap();
    assert_eq!(joined.shape(), Shape::new(3, 2));
    assert_eq!(joined.unjoin((1, 0, 0), b.shape()).unwrap().to_vec(), b.to_vec());

    let embedded = Matrix::embed(&b, (1, 0, 0), joined.shape()).unwrap();
    assert_eq!(embedded.to_vec(), vec![0.0, 0.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_dot_against_hand_computed_product() {
    let a = Matrix::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap();
    let b = Matrix::column(&[1.0, 0.0, -1.0]);
    assert_eq!(a.dot(&b).unwrap().to_vec(), vec![-2.0, -2.0]);
    assert!(matches!(b.dot(&a), Err(MatrixError::ShapeMismatch { .. })));
}

// ============================================================================
// Convolution and pooling
// ============================================================================

#[test]
fn test_crosscorrelate_output_shape_and_values() {
    let input = Matrix::from_vec((0..16).map(f64::from).collect(), (4, 4)).unwrap();
    let filter = Matrix::from_rows(&[&[1.0, 0.0], &[0.0, 1.0]]).unwrap();
    let out = input.crosscorrelate(&filter, ConvolutionParams::default()).unwrap();
    assert_eq!(out.shape(), Shape::new(3, 3));
    assert_eq!(out.get(0, 0), 0.0 + 5.0);
    assert_eq!(out.get(2, 2), 10.0 + 15.0);

    let strided = input.crosscorrelate(&filter, ConvolutionParams::new(2, 1)).unwrap();
    assert_eq!(strided.shape(), Shape::new(2, 2));
}

#[test]
fn test_max_pool_positions_route_gradient() {
    let input = Matrix::from_rows(&[&[1.0, 3.0], &[2.0, 0.0]]).unwrap();
    let (pooled, positions) = input.max_pool(PoolParams::new(2, 2)).unwrap();
    assert_eq!(pooled.value(), 3.0);
    let routed = Matrix::positional_pool_gradient(&Matrix::scalar(5.0), &positions).unwrap();
    assert_eq!(routed.to_vec(), vec![0.0, 5.0, 0.0, 0.0]);
}

#[test]
fn test_average_pool_spreads_gradient() {
    let input = Matrix::filled((2, 2), 1.0);
    let params = PoolParams::new(2, 2);
    assert_eq!(input.average_pool(params).unwrap().value(), 1.0);
    let gradient = Matrix::average_pool_gradient(&Matrix::scalar(4.0), input.shape(), params).unwrap();
    assert_eq!(gradient.to_vec(), vec![1.0; 4]);
}

// ============================================================================
// Reductions and functions
// ============================================================================

#[test]
fn test_reductions() {
    let a = Matrix::from_rows(&[&[1.0, 2.0], &[3.0, 4.0]]).unwrap();
    assert_eq!(a.sum().value(), 10.0);
    assert_eq!(a.mean().value(), 2.5);
    assert_abs_diff_eq!(a.variance(2.5).value(), 1.25, epsilon = 1e-12);
    assert_abs_diff_eq!(a.norm(2.0).unwrap().value(), 30f64.sqrt(), epsilon = 1e-12);

    let values = [Matrix::column(&[1.0, 2.0]), Matrix::column(&[3.0, 6.0])];
    assert_eq!(Matrix::mean_of(&values).unwrap().to_vec(), vec![2.0, 4.0]);
    assert_eq!(Matrix::sum_of(&values).unwrap().to_vec(), vec![4.0, 8.0]);
}

#[test]
fn test_sigmoid_gradient_matches_finite_difference() {
    let a = Matrix::column(&[-1.0, 0.0, 0.5]);
    let r = UnaryFunction::Sigmoid.apply(&a);
    let ones = Matrix::filled(a.shape(), 1.0);
    let analytic = UnaryFunction::Sigmoid.gradient(&a, &r, &ones).unwrap().to_vec();

    let eps = 1e-6;
    let numerical: Vec<f64> = a
        .to_vec()
        .iter()
        .map(|&x| {
            let f = |v: f64| UnaryFunction::Sigmoid.apply(&Matrix::scalar(v)).value();
            (f(x + eps) - f(x - eps)) / (2.0 * eps)
        })
        .collect();
    assert_close(&analytic, &numerical, 1e-8);
}
