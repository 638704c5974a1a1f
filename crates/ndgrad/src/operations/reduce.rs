//! Reductions and reverse-broadcast.

use crate::error::{AutogradError, Result};
use crate::scalar::Scalar;
use crate::size::Size;
use crate::strides::{broadcast_strides, increment};
use crate::tensor::DenseTensor;

pub fn sum<T: Scalar>(tensor: &DenseTensor<T>) -> T {
    tensor.data().iter().fold(T::zero(), |acc, &x| acc + x)
}

/// Arithmetic mean; zero for an empty tensor.
pub fn mean<T: Scalar>(tensor: &DenseTensor<T>) -> T {
    if tensor.is_empty() {
        return T::zero();
    }
    sum(tensor) / T::from_f64(tensor.len() as f64)
}

/// Frobenius (2-) norm.
pub fn norm<T: Scalar>(tensor: &DenseTensor<T>) -> T {
    Scalar::sqrt(tensor.data().iter().fold(T::zero(), |acc, &x| acc + x * x))
}

/// Linear index of the largest element; the first one wins ties.
pub fn argmax<T: Scalar>(tensor: &DenseTensor<T>) -> Option<usize> {
    let mut best: Option<(usize, T)> = None;
    for (i, &x) in tensor.data().iter().enumerate() {
        match best {
            Some((_, b)) if !(x > b) => {}
            _ => best = Some((i, x)),
        }
    }
    best.map(|(i, _)| i)
}

/// Sum `tensor` down to `target`, the inverse of broadcasting.
///
/// Leading axes missing from `target` and axes where `target` has extent 1
/// are summed over. Fails unless `target` broadcasts to the tensor's shape.
///
/// ```
/// use ndgrad::DenseTensor;
/// use ndgrad::operations::sum_to;
///
/// let t = DenseTensor::<f64>::ones(&[2, 3, 4]);
/// let r = sum_to(&t, &[1, 4]).unwrap();
/// assert_eq!(r.shape(), &[1, 4]);
/// assert!(r.data().iter().all(|&x| x == 6.0));
/// ```
pub fn sum_to<T: Scalar>(tensor: &DenseTensor<T>, target: &[usize]) -> Result<DenseTensor<T>> {
    if tensor.shape() == target {
        return Ok(tensor.clone());
    }
    let source = tensor.shape();
    if !Size::new(target).broadcasts_to(&Size::new(source)) {
        return Err(AutogradError::incompatible(
            source,
            target,
            "target does not broadcast to the source shape",
        ));
    }

    let ts = broadcast_strides(target, source);
    let mut out = vec![T::zero(); target.iter().product()];
    let mut idx = vec![0usize; source.len()];
    for &x in tensor.data() {
        let t: usize = idx.iter().zip(&ts).map(|(i, s)| i * s).sum();
        out[t] = out[t] + x;
        increment(&mut idx, source);
    }
    DenseTensor::from_vec(out, target)
}

/// Expand `tensor` to `target` by repeating along broadcast axes.
pub fn broadcast_to<T: Scalar>(tensor: &DenseTensor<T>, target: &[usize]) -> Result<DenseTensor<T>> {
    if tensor.shape() == target {
        return Ok(tensor.clone());
    }
    if !Size::new(tensor.shape()).broadcasts_to(&Size::new(target)) {
        return Err(AutogradError::incompatible(
            tensor.shape(),
            target,
            "source does not broadcast to the target shape",
        ));
    }

    let ss = broadcast_strides(tensor.shape(), target);
    let total: usize = target.iter().product();
    let mut out = Vec::with_capacity(total);
    let mut idx = vec![0usize; target.len()];
    for _ in 0..total {
        let s: usize = idx.iter().zip(&ss).map(|(i, s)| i * s).sum();
        out.push(tensor.data()[s]);
        increment(&mut idx, target);
    }
    DenseTensor::from_vec(out, target)
}
