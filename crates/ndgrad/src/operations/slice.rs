//! Tensor slicing operations.

use std::ops::Range;

use crate::error::{AutogradError, Result};
use crate::scalar::Scalar;
use crate::strides::{cartesian_to_linear, increment};
use crate::tensor::DenseTensor;

fn validate_ranges(shape: &[usize], ranges: &[Range<usize>]) -> Result<Vec<usize>> {
    if ranges.len() != shape.len() {
        return Err(AutogradError::WrongNumberOfIndices {
            expected: shape.len(),
            actual: ranges.len(),
        });
    }
    ranges
        .iter()
        .enumerate()
        .map(|(dim, range)| {
            if range.start > range.end || range.end > shape[dim] {
                Err(AutogradError::SliceOutOfBounds {
                    start: range.start,
                    end: range.end,
                    dim,
                    size: shape[dim],
                })
            } else {
                Ok(range.end - range.start)
            }
        })
        .collect()
}

/// Copy out the block selected by one range per dimension.
///
/// ```
/// use ndgrad::DenseTensor;
/// use ndgrad::operations::slice;
///
/// let t = DenseTensor::<f64>::ones(&[4, 5, 6]);
/// let s = slice(&t, &[1..3, 0..5, 2..4]).unwrap();
/// assert_eq!(s.shape(), &[2, 5, 2]);
/// ```
pub fn slice<T: Scalar>(tensor: &DenseTensor<T>, ranges: &[Range<usize>]) -> Result<DenseTensor<T>> {
    let new_shape = validate_ranges(tensor.shape(), ranges)?;
    let total: usize = new_shape.iter().product();
    let mut data = Vec::with_capacity(total);
    let mut indices = vec![0usize; new_shape.len()];
    for _ in 0..total {
        let src: Vec<usize> = indices
            .iter()
            .zip(ranges)
            .map(|(&i, range)| range.start + i)
            .collect();
        data.push(tensor.data()[cartesian_to_linear(&src, tensor.strides())]);
        increment(&mut indices, &new_shape);
    }
    DenseTensor::from_vec(data, &new_shape)
}

/// Write `values` into the block selected by `ranges`.
pub fn slice_assign<T: Scalar>(
    tensor: &mut DenseTensor<T>,
    ranges: &[Range<usize>],
    values: &DenseTensor<T>,
) -> Result<()> {
    let block = validate_ranges(tensor.shape(), ranges)?;
    let expected: usize = block.iter().product();
    if values.len() != expected {
        return Err(AutogradError::ShapeMismatch {
            expected,
            actual: values.len(),
        });
    }
    let strides = tensor.strides().to_vec();
    let dest = tensor.data_mut();
    let mut indices = vec![0usize; block.len()];
    for &value in values.data() {
        let target: Vec<usize> = indices
            .iter()
            .zip(ranges)
            .map(|(&i, range)| range.start + i)
            .collect();
        dest[cartesian_to_linear(&target, &strides)] = value;
        increment(&mut indices, &block);
    }
    Ok(())
}
