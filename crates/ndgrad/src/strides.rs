//! Column-major index arithmetic.
//!
//! Dense payloads store their elements in column-major (Fortran) order, the
//! layout faer expects, so a `[rows, cols]` tensor is a faer matrix view
//! without copying.

/// Compute column-major strides from shape.
///
/// For shape [d0, d1, d2, ...], returns strides [1, d0, d0*d1, ...].
///
/// ```
/// use ndgrad::strides::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]), vec![1, 3, 12]);
/// assert_eq!(compute_strides(&[]), Vec::<usize>::new());
/// ```
pub fn compute_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut stride = 1;
    for &dim in shape {
        strides.push(stride);
        stride *= dim;
    }
    strides
}

/// Strides that read a `source`-shaped buffer as if it had shape `target`.
///
/// `source` is right-aligned against `target` (numpy rules); axes where the
/// source has extent 1, or does not exist, get stride 0 so every target
/// coordinate along them maps to the same element. Callers must have
/// validated broadcast compatibility.
pub fn broadcast_strides(source: &[usize], target: &[usize]) -> Vec<usize> {
    let own = compute_strides(source);
    let offset = target.len() - source.len();
    (0..target.len())
        .map(|axis| {
            if axis < offset || source[axis - offset] == 1 {
                0
            } else {
                own[axis - offset]
            }
        })
        .collect()
}

/// Convert cartesian indices to a linear index.
#[inline]
pub fn cartesian_to_linear(indices: &[usize], strides: &[usize]) -> usize {
    indices
        .iter()
        .zip(strides)
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Convert a linear index to cartesian indices for `shape`.
pub fn linear_to_cartesian(mut linear: usize, shape: &[usize]) -> Vec<usize> {
    let mut indices = Vec::with_capacity(shape.len());
    for &dim in shape {
        indices.push(linear % dim);
        linear /= dim;
    }
    indices
}

/// Advance a column-major multi-index by one, returning `false` on wrap.
#[inline]
pub(crate) fn increment(indices: &mut [usize], shape: &[usize]) -> bool {
    for (idx, &dim) in indices.iter_mut().zip(shape) {
        *idx += 1;
        if *idx < dim {
            return true;
        }
        *idx = 0;
    }
    false
}
