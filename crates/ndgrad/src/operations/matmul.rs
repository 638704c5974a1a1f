//! Matrix products over dense tensors.
//!
//! Shapes follow [`Size::matmul_plan`]. The 2-D kernel is faer's GEMM,
//! reached through [`Scalar::gemm`]. A column-major `[B, m, k]` buffer is
//! already a `(B*m) x k` matrix, so a batch carried by the lhs alone costs a
//! single GEMM; every other batched case gathers one matrix pair per batch
//! entry.

use crate::error::Result;
use crate::scalar::Scalar;
use crate::size::{MatmulPlan, Size};
use crate::strides::{compute_strides, increment};
use crate::tensor::DenseTensor;

/// Matrix product with numpy-style rank promotion and batch broadcasting.
///
/// ```
/// use ndgrad::DenseTensor;
/// use ndgrad::operations::matmul;
///
/// // [[1, 2], [3, 4]] in column-major order
/// let a = DenseTensor::from_vec(vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap();
/// let v = DenseTensor::from_vec(vec![1.0, 1.0], &[2]).unwrap();
/// let r = matmul(&a, &v).unwrap();
/// assert_eq!(r.shape(), &[2]);
/// assert_eq!(r.data(), &[3.0, 7.0]);
/// ```
pub fn matmul<T: Scalar>(lhs: &DenseTensor<T>, rhs: &DenseTensor<T>) -> Result<DenseTensor<T>> {
    let plan = Size::matmul_plan(&Size::new(lhs.shape()), &Size::new(rhs.shape()))?;
    let out = if plan.batch.is_scalar() || plan.flattened {
        let rows = plan.batch.numel() * plan.m();
        let mut out = vec![T::zero(); rows * plan.n()];
        T::gemm(&mut out, lhs.data(), rhs.data(), rows, plan.k(), plan.n());
        out
    } else {
        batched(lhs.data(), rhs.data(), &plan)
    };
    DenseTensor::from_vec(out, plan.result.dims())
}

fn batched<T: Scalar>(lhs: &[T], rhs: &[T], plan: &MatmulPlan) -> Vec<T> {
    let (m, k, n) = (plan.m(), plan.k(), plan.n());
    let batch = plan.batch.dims();
    let lhs_shape = plan.lhs.dims();
    let rhs_shape = plan.rhs.dims();
    let lhs_strides = compute_strides(lhs_shape);
    let rhs_strides = compute_strides(rhs_shape);
    let out_strides = compute_strides(plan.product.dims());
    let lhs_batch = batch_strides(lhs_shape, batch);
    let rhs_batch = batch_strides(rhs_shape, batch);
    let (lr, rr, br) = (lhs_shape.len(), rhs_shape.len(), batch.len());

    let mut out = vec![T::zero(); plan.product.numel()];
    let mut a = vec![T::zero(); m * k];
    let mut b = vec![T::zero(); k * n];
    let mut c = vec![T::zero(); m * n];
    let mut idx = vec![0usize; br];
    for _ in 0..plan.batch.numel() {
        let offset = |strides: &[usize]| -> usize { idx.iter().zip(strides).map(|(i, s)| i * s).sum() };
        let (la, rb, oc) = (offset(&lhs_batch), offset(&rhs_batch), offset(&out_strides[..br]));

        for j in 0..k {
            for i in 0..m {
                a[i + m * j] = lhs[la + i * lhs_strides[lr - 2] + j * lhs_strides[lr - 1]];
            }
        }
        for j in 0..n {
            for i in 0..k {
                b[i + k * j] = rhs[rb + i * rhs_strides[rr - 2] + j * rhs_strides[rr - 1]];
            }
        }
        T::gemm(&mut c, &a, &b, m, k, n);
        for j in 0..n {
            for i in 0..m {
                out[oc + i * out_strides[br] + j * out_strides[br + 1]] = c[i + m * j];
            }
        }
        increment(&mut idx, batch);
    }
    out
}

/// Stride of each broadcast batch axis within an operand, 0 where the
/// operand is broadcast along it.
fn batch_strides(operand: &[usize], batch: &[usize]) -> Vec<usize> {
    let strides = compute_strides(operand);
    let own = operand.len() - 2;
    let offset = batch.len() - own;
    (0..batch.len())
        .map(|axis| {
            if axis < offset || operand[axis - offset] == 1 {
                0
            } else {
                strides[axis - offset]
            }
        })
        .collect()
}
