//! Integration tests for the autograd engine.
//!
//! Chain rules, graph bookkeeping and handle semantics, with numerical
//! gradient checks for composite expressions.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use approx::assert_relative_eq;
use ndgrad::autograd::{is_grad_enabled, no_grad};
use ndgrad::{
    AutogradError, BackwardConfig, DenseTensor, NoGradGuard, Registry, SavePolicy, Size,
    ValueBuilder,
};

type Dense = DenseTensor<f64>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// Compute numerical gradient using central difference.
///
/// grad_i ≈ (f(x + eps*e_i) - f(x - eps*e_i)) / (2*eps)
fn numerical_gradient<F>(f: F, x: &[f64], eps: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grad = vec![0.0; x.len()];
    let mut x_plus = x.to_vec();
    let mut x_minus = x.to_vec();

    for i in 0..x.len() {
        x_plus[i] = x[i] + eps;
        x_minus[i] = x[i] - eps;
        grad[i] = (f(&x_plus) - f(&x_minus)) / (2.0 * eps);
        x_plus[i] = x[i];
        x_minus[i] = x[i];
    }
    grad
}

fn tensor(data: &[f64], shape: &[usize]) -> Dense {
    DenseTensor::from_vec(data.to_vec(), shape).unwrap()
}

#[test]
fn test_example_scenario() {
    init_tracing();
    let r = Registry::<f64>::new("example");
    let a = ValueBuilder::new()
        .data(2.6)
        .requires_grad(true)
        .build(&r)
        .unwrap();
    let b = ValueBuilder::new()
        .data(3.6)
        .requires_grad(true)
        .build(&r)
        .unwrap();

    let result = a.add(&b).unwrap();
    assert_relative_eq!(result.item().unwrap(), 6.2, epsilon = 1e-12);
    assert_eq!(
        result.predecessors(),
        vec![a.node_id().unwrap(), b.node_id().unwrap()]
    );
    assert!(result.grad().unwrap().is_none());

    result.backward().unwrap();
    assert!(a.grad().unwrap().is_some());
    assert!(b.grad().unwrap().is_some());
    r.close_all();
}

#[test]
fn test_leaf_construction() {
    let r = Registry::<Dense>::new("leaf");
    for requires_grad in [true, false] {
        let x = ValueBuilder::new()
            .data(DenseTensor::ones(&[2, 3]))
            .requires_grad(requires_grad)
            .build(&r)
            .unwrap();
        assert!(x.predecessors().is_empty());
        assert!(x.grad().unwrap().is_none());
        assert_eq!(x.requires_grad(), requires_grad);
    }
    r.close_all();
}

#[test]
fn test_additive_chain_rule() {
    let r = Registry::<Dense>::new("additive");
    let a = r.variable(tensor(&[1.0, 2.0, 3.0], &[3])).unwrap();
    let b = r.variable(tensor(&[4.0, 5.0, 6.0], &[3])).unwrap();
    let c = a.add(&b).unwrap();
    let seed = tensor(&[0.5, -1.0, 2.0], &[3]);
    c.backward_seed(seed.clone()).unwrap();

    assert_eq!(a.grad().unwrap().unwrap().to_vec().unwrap(), seed.data());
    assert_eq!(b.grad().unwrap().unwrap().to_vec().unwrap(), seed.data());
    r.close_all();
}

#[test]
fn test_multiplicative_chain_rule() {
    let r = Registry::<Dense>::new("multiplicative");
    let a = r.variable(tensor(&[1.0, 2.0, 3.0], &[3])).unwrap();
    let b = r.variable(tensor(&[4.0, 5.0, 6.0], &[3])).unwrap();
    let c = a.mul(&b).unwrap();
    c.backward_seed(tensor(&[1.0, 2.0, 3.0], &[3])).unwrap();

    assert_eq!(
        a.grad().unwrap().unwrap().to_vec().unwrap(),
        vec![4.0, 10.0, 18.0]
    );
    assert_eq!(
        b.grad().unwrap().unwrap().to_vec().unwrap(),
        vec![1.0, 4.0, 9.0]
    );
    r.close_all();
}

#[test]
fn test_no_grad_propagation() {
    let r = Registry::<f64>::new("no-grad");
    let a = r.variable(2.0).unwrap();
    let b = r.value(5.0).unwrap();
    let c = a.mul(&b).unwrap();
    assert!(c.requires_grad());
    c.backward().unwrap();

    assert_eq!(a.grad().unwrap().unwrap().item().unwrap(), 5.0);
    assert!(b.grad().unwrap().is_none());
    assert!(c.requires_grad());
    r.close_all();
}

#[test]
fn test_quadratic_gradient() {
    let r = Registry::<f64>::new("quadratic");
    let x = r.variable(3.0).unwrap();
    let y = r.variable(4.0).unwrap();
    let z = x
        .mul(&x)
        .unwrap()
        .add(&y.mul(&x).unwrap())
        .unwrap()
        .add(&y.mul(&y).unwrap())
        .unwrap();
    z.backward().unwrap();
    assert_relative_eq!(x.grad().unwrap().unwrap().item().unwrap(), 10.0);
    assert_relative_eq!(y.grad().unwrap().unwrap().item().unwrap(), 11.0);
    r.close_all();
}

#[test]
fn test_numerical_gradient_dense_layer() {
    // f(W, b) = sum(sigmoid(W @ x + b) * c)
    let eps = 1e-6;
    let w_data: Vec<f64> = (0..6).map(|i| 0.1 * i as f64 - 0.2).collect();
    let b_data = vec![0.3, -0.1];
    let x_data = vec![1.0, -2.0, 0.5];
    let c_data = vec![2.0, -1.0];

    let forward = |w: &[f64], b: &[f64]| -> f64 {
        (0..2)
            .map(|i| {
                // column-major W: element (i, j) at i + 2j
                let dot: f64 = (0..3).map(|j| w[i + 2 * j] * x_data[j]).sum();
                let s = 1.0 / (1.0 + (-(dot + b[i])).exp());
                s * c_data[i]
            })
            .sum()
    };
    let numerical_w = numerical_gradient(|w| forward(w, &b_data), &w_data, eps);
    let numerical_b = numerical_gradient(|b| forward(&w_data, b), &b_data, eps);

    let r = Registry::<Dense>::new("dense-layer");
    let w = r.variable(tensor(&w_data, &[2, 3])).unwrap();
    let b = r.variable(tensor(&b_data, &[2])).unwrap();
    let x = r.value(tensor(&x_data, &[3])).unwrap();
    let c = r.value(tensor(&c_data, &[2])).unwrap();
    let loss = w
        .matmul(&x)
        .unwrap()
        .add(&b)
        .unwrap()
        .sigmoid()
        .unwrap()
        .mul(&c)
        .unwrap()
        .sum()
        .unwrap();
    assert_relative_eq!(loss.item().unwrap(), forward(&w_data, &b_data), epsilon = 1e-12);
    loss.backward().unwrap();

    let analytical_w = w.grad().unwrap().unwrap().to_vec().unwrap();
    let analytical_b = b.grad().unwrap().unwrap().to_vec().unwrap();
    for (analytical, numerical) in analytical_w.iter().zip(&numerical_w) {
        assert_relative_eq!(analytical, numerical, epsilon = 1e-6);
    }
    for (analytical, numerical) in analytical_b.iter().zip(&numerical_b) {
        assert_relative_eq!(analytical, numerical, epsilon = 1e-6);
    }
    r.close_all();
}

#[test]
fn test_gradients_accumulate_over_fan_out() {
    let r = Registry::<f64>::new("fan-out");
    let x = r.variable(2.0).unwrap();
    let e = x.exp().unwrap();
    // y = e * e + e, dy/dx = (2e + 1) * e
    let y = e.mul(&e).unwrap().add(&e).unwrap();
    y.backward().unwrap();
    let ex = 2.0f64.exp();
    assert_relative_eq!(
        x.grad().unwrap().unwrap().item().unwrap(),
        (2.0 * ex + 1.0) * ex,
        epsilon = 1e-9
    );
    r.close_all();
}

#[test]
fn test_gradient_handle_tracks_accumulation() {
    let r = Registry::<f64>::new("handle");
    let x = r.variable(1.0).unwrap();
    x.scale(3.0).unwrap().backward().unwrap();
    let grad = x.grad().unwrap().unwrap();
    assert_eq!(grad.item().unwrap(), 3.0);

    // A second, independent graph adds into the same handle.
    x.scale(4.0).unwrap().backward().unwrap();
    assert_eq!(grad.item().unwrap(), 7.0);
    assert_eq!(x.grad().unwrap().unwrap().id(), grad.id());
    r.close_all();
}

#[test]
fn test_grad_with_close_detaches() {
    let r = Registry::<f64>::new("detach");
    let x = r.variable(1.0).unwrap();
    x.scale(2.0).unwrap().backward().unwrap();
    let detached = x.grad_with(true).unwrap().unwrap();
    assert!(x.grad().unwrap().is_none());

    // Closing the value no longer closes the detached gradient.
    x.close();
    assert!(!detached.is_closed());
    assert_eq!(detached.item().unwrap(), 2.0);
    detached.close();
    r.close_all();
}

#[test]
fn test_no_grad_guard_disables_recording() {
    let r = Registry::<f64>::new("guard");
    let x = r.variable(1.5).unwrap();
    let y = {
        let _guard = NoGradGuard::new();
        assert!(!is_grad_enabled());
        x.mul(&x).unwrap()
    };
    assert!(is_grad_enabled());
    assert!(y.is_leaf());
    assert!(!y.requires_grad());
    assert!(matches!(y.backward(), Err(AutogradError::IllegalState(_))));

    let z = no_grad(|| x.exp().unwrap());
    assert!(!z.requires_grad());
    r.close_all();
}

#[test]
fn test_saved_copies_follow_policy() {
    for policy in [SavePolicy::Shared, SavePolicy::Copied] {
        let r = Registry::<Dense>::with_policy("policy", policy);
        assert_eq!(r.save_policy(), policy);
        let x = r.variable(tensor(&[1.0, 2.0], &[2])).unwrap();
        let y = x.mul(&x).unwrap().sum().unwrap();
        // The leaf is updated after recording; backward uses the recorded
        // operand.
        x.scale_(10.0).unwrap();
        y.backward().unwrap();
        assert_eq!(
            x.grad().unwrap().unwrap().to_vec().unwrap(),
            vec![2.0, 4.0]
        );
        r.close_all();
    }
}

#[test]
fn test_leaf_updated_after_recording_agrees_across_modes() {
    for keep_graph in [false, true] {
        let r = Registry::<f64>::new("inplace-leaf");
        let x = r.variable(3.0).unwrap();
        let y = x.mul(&x).unwrap();
        x.scale_(2.0).unwrap();
        assert_eq!(x.item().unwrap(), 6.0);
        y.backward_with(BackwardConfig::new().with_keep_graph(keep_graph))
            .unwrap();
        // dy/dx at the recorded x = 3.
        assert_relative_eq!(x.grad().unwrap().unwrap().item().unwrap(), 6.0);
        r.close_all();
    }
}

#[test]
fn test_swap_is_visible_through_every_handle() {
    let r = Registry::<f64>::new("swap");
    let a = r.variable(1.0).unwrap();
    let alias = a.clone();
    let b = r.variable(5.0).unwrap();
    a.swap_with(&b).unwrap();
    assert_eq!(alias.item().unwrap(), 5.0);
    assert_eq!(b.item().unwrap(), 1.0);

    // The graph follows the contents: differentiating a result built from
    // `alias` deposits into the slot now holding that node.
    let y = alias.scale(2.0).unwrap();
    y.backward().unwrap();
    assert_eq!(alias.grad().unwrap().unwrap().item().unwrap(), 2.0);
    assert!(b.grad().unwrap().is_none());
    r.close_all();
}

#[test]
fn test_native_gradient_interop() {
    let r = Registry::<f64>::new("native");
    let x = r.variable(2.0).unwrap();
    x.mul(&x).unwrap().backward().unwrap();
    assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 4.0);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    x.set_native_grad(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Some(42.0)
    })
    .unwrap();
    assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 42.0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A native supplier without a value falls back to the local gradient.
    x.set_native_grad(|| None).unwrap();
    assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 4.0);

    x.set_native_grad(|| Some(-1.0)).unwrap();
    x.disable_native_grad(true).unwrap();
    assert_eq!(x.grad().unwrap().unwrap().item().unwrap(), 4.0);
    r.close_all();
}

#[test]
fn test_view_reshape_round_trip() {
    let r = Registry::<Dense>::new("views");
    let data: Vec<f64> = (0..24).map(f64::from).collect();
    let x = r.variable(tensor(&data, &[2, 3, 4])).unwrap();

    for dims in [vec![24], vec![6, 4], vec![4, 3, 2], vec![2, 3, 4]] {
        let s = Size::new(&dims);
        let reshaped = x.reshape(s.clone()).unwrap();
        assert_eq!(reshaped.size().unwrap(), s);
        assert_eq!(reshaped.numel().unwrap(), 24);

        let back = x.view(s).unwrap().reshape([2, 3, 4]).unwrap();
        assert_eq!(back.to_vec().unwrap(), data);
    }
    r.close_all();
}

#[test]
fn test_annotated_size_survives_elementwise_ops() {
    let r = Registry::<Dense>::new("annotated");
    let size = Size::nested(vec![
        Size::from_dims(vec![ndgrad::Dim::new(2).named("batch")]),
        Size::from_dims(vec![ndgrad::Dim::new(3).named("features")]),
    ]);
    let x = ValueBuilder::new()
        .data(DenseTensor::ones(&[2, 3]))
        .size(size.clone())
        .requires_grad(true)
        .build(&r)
        .unwrap();
    let y = x.relu().unwrap().scale(2.0).unwrap();
    assert_eq!(y.size().unwrap().to_string(), size.to_string());
    r.close_all();
}

#[test]
fn test_construction_errors() {
    let r = Registry::<Dense>::new("errors");
    assert!(matches!(
        ValueBuilder::<Dense>::new().build(&r),
        Err(AutogradError::InvalidConstruction(_))
    ));

    let x = r.variable(DenseTensor::ones(&[2])).unwrap();
    x.close();
    assert!(x.is_closed());
    let y = r.variable(DenseTensor::ones(&[2])).unwrap();
    assert!(matches!(
        y.mul(&x),
        Err(AutogradError::InvalidConstruction(_))
    ));
    assert!(matches!(
        y.reshape([3]),
        Err(AutogradError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        y.matmul(&r.value(DenseTensor::ones(&[3, 2])).unwrap()),
        Err(AutogradError::IncompatibleShapes { .. })
    ));
    r.close_all();
}

#[test]
fn test_scalar_backend_rejects_matmul() {
    let r = Registry::<f64>::new("scalar-matmul");
    let a = r.variable(2.0).unwrap();
    let b = r.variable(3.0).unwrap();
    assert!(matches!(
        a.matmul(&b),
        Err(AutogradError::Unsupported {
            op: "matmul",
            backend: "scalar"
        })
    ));
    r.close_all();
}

#[test]
fn test_backward_after_release_fails() {
    let r = Registry::<f64>::new("released");
    let x = r.variable(2.0).unwrap();
    let y = x.exp().unwrap();
    y.backward().unwrap();
    assert!(matches!(
        y.backward(),
        Err(AutogradError::GraphReleased { .. })
    ));

    // Keeping the graph allows repeated passes.
    let z = x.exp().unwrap();
    z.backward_with(BackwardConfig::retained()).unwrap();
    z.backward_with(BackwardConfig::retained()).unwrap();
    z.backward().unwrap();
    assert!(z.backward().is_err());
    r.close_all();
}

#[test]
fn test_random_payloads_are_differentiable() {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    let mut rng = StdRng::seed_from_u64(7);
    let r = Registry::<Dense>::new("random");
    let w = r
        .variable(DenseTensor::randn_with_rng(&[4, 3], &mut rng))
        .unwrap();
    let x = r
        .value(DenseTensor::random_with_rng(&[3, 5], &mut rng))
        .unwrap();
    w.matmul(&x).unwrap().mean().unwrap().backward().unwrap();

    // d mean(W X) / dW_ij = sum_k X_jk / (4 * 5)
    let xd = x.data().unwrap();
    let g = w.grad().unwrap().unwrap();
    for i in 0..4 {
        for j in 0..3 {
            let expected: f64 = (0..5).map(|k| xd.get(&[j, k]).copied().unwrap()).sum::<f64>() / 20.0;
            assert_relative_eq!(g.get_at(&[i, j]).unwrap(), expected, epsilon = 1e-12);
        }
    }
    r.close_all();
}
