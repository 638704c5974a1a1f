//! Permutation operations for tensors.

use crate::error::{AutogradError, Result};
use crate::scalar::Scalar;
use crate::strides::{cartesian_to_linear, linear_to_cartesian};
use crate::tensor::DenseTensor;

/// Permute the dimensions of a tensor into a new tensor.
///
/// `perm[i]` gives the source dimension for the i-th dimension of the
/// result.
///
/// ```
/// use ndgrad::DenseTensor;
/// use ndgrad::operations::permutedims;
///
/// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
/// let t2 = permutedims(&t, &[1, 0]).unwrap();
/// assert_eq!(t2.shape(), &[3, 2]);
/// assert_eq!(t.get(&[1, 0]), t2.get(&[0, 1]));
/// ```
pub fn permutedims<T: Scalar>(tensor: &DenseTensor<T>, perm: &[usize]) -> Result<DenseTensor<T>> {
    validate_permutation(perm, tensor.ndim())?;
    if perm.iter().enumerate().all(|(i, &p)| i == p) {
        return Ok(tensor.clone());
    }

    let new_shape: Vec<usize> = perm.iter().map(|&p| tensor.shape()[p]).collect();
    let mut result = DenseTensor::zeros(&new_shape);
    let new_strides = result.strides().to_vec();
    let dest = result.data_mut();
    for (linear_old, &value) in tensor.data().iter().enumerate() {
        let old = linear_to_cartesian(linear_old, tensor.shape());
        let new: Vec<usize> = perm.iter().map(|&p| old[p]).collect();
        dest[cartesian_to_linear(&new, &new_strides)] = value;
    }
    Ok(result)
}

/// Swap the last two axes; tensors of rank < 2 are returned unchanged.
pub fn transpose_last2<T: Scalar>(tensor: &DenseTensor<T>) -> Result<DenseTensor<T>> {
    let n = tensor.ndim();
    if n < 2 {
        return Ok(tensor.clone());
    }
    let mut perm: Vec<usize> = (0..n).collect();
    perm.swap(n - 2, n - 1);
    permutedims(tensor, &perm)
}

fn validate_permutation(perm: &[usize], ndim: usize) -> Result<()> {
    let invalid = || AutogradError::InvalidPermutation {
        perm: perm.to_vec(),
        ndim,
    };
    if perm.len() != ndim {
        return Err(invalid());
    }
    let mut seen = vec![false; ndim];
    for &p in perm {
        if p >= ndim || seen[p] {
            return Err(invalid());
        }
        seen[p] = true;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permutedims_3d() {
        let mut t: DenseTensor<f64> = DenseTensor::zeros(&[2, 3, 4]);
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..4 {
                    t.set(&[i, j, k], (i * 100 + j * 10 + k) as f64).unwrap();
                }
            }
        }

        let t2 = permutedims(&t, &[2, 0, 1]).unwrap();
        assert_eq!(t2.shape(), &[4, 2, 3]);
        for i in 0..2 {
            for j in 0..3 {
                for k in 0..4 {
                    assert_eq!(t.get(&[i, j, k]), t2.get(&[k, i, j]));
                }
            }
        }
    }

    #[test]
    fn test_permutedims_identity_shares_storage() {
        let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let t2 = permutedims(&t, &[0, 1]).unwrap();
        assert!(t.shares_storage_with(&t2));
    }

    #[test]
    fn test_permutedims_invalid() {
        let t: DenseTensor<f64> = DenseTensor::zeros(&[2, 3]);
        assert!(permutedims(&t, &[0]).is_err());
        assert!(permutedims(&t, &[0, 1, 2]).is_err());
        assert!(permutedims(&t, &[0, 2]).is_err());
        assert!(permutedims(&t, &[0, 0]).is_err());
    }

    #[test]
    fn test_transpose_last2_batched() {
        let t = DenseTensor::from_fn(&[2, 3, 4], |i| i as f64);
        let tt = transpose_last2(&t).unwrap();
        assert_eq!(tt.shape(), &[2, 4, 3]);
        assert_eq!(t.get(&[1, 2, 3]), tt.get(&[1, 3, 2]));

        let v = DenseTensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        assert_eq!(transpose_last2(&v).unwrap().shape(), &[2]);
    }
}
