//! Element-wise tensor operations.

use crate::error::Result;
use crate::scalar::Scalar;
use crate::size::Size;
use crate::strides::{broadcast_strides, increment};
use crate::tensor::DenseTensor;

/// Combine two tensors element by element, broadcasting numpy-style.
///
/// ```
/// use ndgrad::DenseTensor;
/// use ndgrad::operations::zip_broadcast;
///
/// let a = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// let b = DenseTensor::from_vec(vec![10.0, 20.0], &[2]).unwrap();
/// let c = zip_broadcast(&a, &b, |x, y| x + y).unwrap();
/// // b is laid along the last axis: column j gets b[j]
/// assert_eq!(c.data(), &[11.0, 12.0, 23.0, 24.0]);
/// ```
pub fn zip_broadcast<T: Scalar>(
    lhs: &DenseTensor<T>,
    rhs: &DenseTensor<T>,
    f: impl Fn(T, T) -> T,
) -> Result<DenseTensor<T>> {
    if lhs.shape() == rhs.shape() {
        let data = lhs
            .data()
            .iter()
            .zip(rhs.data())
            .map(|(&a, &b)| f(a, b))
            .collect();
        return DenseTensor::from_vec(data, lhs.shape());
    }

    let out = Size::new(lhs.shape()).broadcast(&Size::new(rhs.shape()))?;
    let out_shape = out.dims();
    let ls = broadcast_strides(lhs.shape(), out_shape);
    let rs = broadcast_strides(rhs.shape(), out_shape);

    let mut data = Vec::with_capacity(out.numel());
    let mut idx = vec![0usize; out_shape.len()];
    let (mut li, mut ri) = (0usize, 0usize);
    loop {
        data.push(f(lhs.data()[li], rhs.data()[ri]));
        if !increment(&mut idx, out_shape) {
            break;
        }
        li = idx.iter().zip(&ls).map(|(i, s)| i * s).sum();
        ri = idx.iter().zip(&rs).map(|(i, s)| i * s).sum();
    }
    DenseTensor::from_vec(data, out_shape)
}

/// Multiply every element by `alpha`.
pub fn scale<T: Scalar>(tensor: &DenseTensor<T>, alpha: T) -> DenseTensor<T> {
    tensor.map(|x| x * alpha)
}

/// Scale in place.
pub fn scale_inplace<T: Scalar>(tensor: &mut DenseTensor<T>, alpha: T) {
    for x in tensor.data_mut() {
        *x = *x * alpha;
    }
}

/// 1 where the element is strictly greater than `threshold`, 0 elsewhere.
pub fn threshold<T: Scalar>(tensor: &DenseTensor<T>, threshold: T) -> DenseTensor<T> {
    tensor.map(|x| if x > threshold { T::one() } else { T::zero() })
}

pub fn relu<T: Scalar>(tensor: &DenseTensor<T>) -> DenseTensor<T> {
    tensor.map(|x| if x > T::zero() { x } else { T::zero() })
}

pub fn sigmoid<T: Scalar>(tensor: &DenseTensor<T>) -> DenseTensor<T> {
    tensor.map(|x| T::one() / (T::one() + Scalar::exp(-x)))
}
