//! Hessian-vector products by double backward.

use std::collections::HashSet;

use tracing::debug;

use super::backward::BackwardConfig;
use super::node::ValueId;
use super::value::AutogradValue;
use crate::error::{AutogradError, Result};
use crate::payload::Payload;

/// Compute `H · v` where `H` is the Hessian of the scalar `f(inputs)`.
///
/// Runs `f`, backpropagates with a kept graph, forms `Σ sum(∂f/∂xᵢ · vᵢ)`
/// and backpropagates that. Existing gradients of `inputs` are cleared.
/// The returned values are detached from the inputs' grad nodes and owned
/// by the caller; every other value created along the way is closed.
///
/// ```
/// use ndgrad::{Registry, autograd::hessian::hvp};
///
/// let r = Registry::<f64>::new("hvp-doc");
/// let x = r.variable(3.0).unwrap();
/// let v = r.value(1.0).unwrap();
/// // f = x^3, f'' = 6x
/// let h = hvp(|xs| xs[0].mul(&xs[0])?.mul(&xs[0]), &[x], &[v]).unwrap();
/// assert!((h[0].item().unwrap() - 18.0).abs() < 1e-12);
/// r.close_all();
/// ```
pub fn hvp<P, F>(
    f: F,
    inputs: &[AutogradValue<P>],
    v: &[AutogradValue<P>],
) -> Result<Vec<AutogradValue<P>>>
where
    P: Payload,
    F: FnOnce(&[AutogradValue<P>]) -> Result<AutogradValue<P>>,
{
    if inputs.len() != v.len() {
        return Err(AutogradError::ShapeMismatch {
            expected: inputs.len(),
            actual: v.len(),
        });
    }
    let Some(first) = inputs.first() else {
        return Ok(Vec::new());
    };
    let registry = first.registry().clone();
    for x in inputs {
        x.zero_grad()?;
    }

    registry.push_frame();
    let mut first_order = Vec::new();
    let result = double_backward(f, inputs, v, &mut first_order);
    let frame = registry.pop_frame();
    for g in &first_order {
        g.close();
    }

    let mut keep: HashSet<ValueId> = registry.lock().grad_referenced();
    if let Ok(values) = &result {
        keep.extend(values.iter().map(|h| h.id));
    }
    let mut closed = 0;
    for id in frame.into_iter().filter(|id| !keep.contains(id)) {
        closed += registry.close(id);
    }
    debug!(inputs = inputs.len(), closed, "hessian-vector product");
    result
}

fn double_backward<P, F>(
    f: F,
    inputs: &[AutogradValue<P>],
    v: &[AutogradValue<P>],
    first_order: &mut Vec<AutogradValue<P>>,
) -> Result<Vec<AutogradValue<P>>>
where
    P: Payload,
    F: FnOnce(&[AutogradValue<P>]) -> Result<AutogradValue<P>>,
{
    let out = f(inputs)?;
    out.backward_with(BackwardConfig::retained())?;

    let mut dot: Option<AutogradValue<P>> = None;
    for (x, vi) in inputs.iter().zip(v) {
        let Some(g) = x.grad_with(true)? else {
            continue;
        };
        first_order.push(g.clone());
        let term = g.mul(vi)?.sum()?;
        dot = Some(match dot {
            None => term,
            Some(acc) => acc.add(&term)?,
        });
    }

    if let Some(dot) = dot.filter(AutogradValue::requires_grad) {
        dot.backward()?;
    }

    inputs
        .iter()
        .map(|x| match x.grad_with(true)? {
            Some(h) => Ok(h),
            None => {
                let size = x.size()?;
                Ok(x.registry().leaf_sized(P::zeros(&size), size))
            }
        })
        .collect()
}
