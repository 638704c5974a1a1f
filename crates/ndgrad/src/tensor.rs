//! Dense N-dimensional tensor.
//!
//! Storage is a reference-counted column-major buffer. `reshape` shares the
//! buffer; mutation goes through copy-on-write, so a reshaped view never
//! observes writes made through another handle.

use std::sync::Arc;

use crate::error::{AutogradError, Result};
use crate::scalar::Scalar;
use crate::strides::{cartesian_to_linear, compute_strides};

/// Dense column-major tensor over a [`Scalar`] element type.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor<T: Scalar> {
    data: Arc<Vec<T>>,
    shape: Vec<usize>,
    strides: Vec<usize>,
}

impl<T: Scalar> DenseTensor<T> {
    /// Create a zero-filled tensor.
    ///
    /// ```
    /// use ndgrad::DenseTensor;
    ///
    /// let t: DenseTensor<f64> = DenseTensor::zeros(&[2, 3, 4]);
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.len(), 24);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::zero())
    }

    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, T::one())
    }

    /// Create a tensor with every element set to `value`.
    pub fn full(shape: &[usize], value: T) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: Arc::new(vec![value; len]),
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    /// Create a rank-0 tensor holding one value.
    pub fn scalar(value: T) -> Self {
        Self::full(&[], value)
    }

    /// Create a tensor from column-major data.
    ///
    /// # Errors
    ///
    /// Returns `AutogradError::ShapeMismatch` if the data length does not
    /// match the element count of `shape`.
    ///
    /// ```
    /// use ndgrad::DenseTensor;
    ///
    /// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.get(&[1, 0]), Some(&2.0)); // column-major
    /// assert_eq!(t.get(&[0, 1]), Some(&3.0));
    /// ```
    pub fn from_vec(data: Vec<T>, shape: &[usize]) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(AutogradError::ShapeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data: Arc::new(data),
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        })
    }

    /// Create a tensor by evaluating `f` at every linear index.
    pub fn from_fn(shape: &[usize], f: impl FnMut(usize) -> T) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: Arc::new((0..len).map(f).collect()),
            shape: shape.to_vec(),
            strides: compute_strides(shape),
        }
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    #[inline]
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Mutable access to the elements, unsharing the buffer first.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [T] {
        Arc::make_mut(&mut self.data).as_mut_slice()
    }

    /// Consume the tensor and return its elements.
    pub fn into_vec(self) -> Vec<T> {
        Arc::try_unwrap(self.data).unwrap_or_else(|shared| (*shared).clone())
    }

    #[inline]
    pub fn get_linear(&self, i: usize) -> Option<&T> {
        self.data.get(i)
    }

    /// Get an element by cartesian indices; `None` when out of range.
    pub fn get(&self, indices: &[usize]) -> Option<&T> {
        self.linear_index(indices).ok().and_then(|i| self.data.get(i))
    }

    /// Set an element by cartesian indices.
    pub fn set(&mut self, indices: &[usize], value: T) -> Result<()> {
        let linear = self.linear_index(indices)?;
        self.data_mut()[linear] = value;
        Ok(())
    }

    /// Set an element by linear index.
    pub fn set_linear(&mut self, index: usize, value: T) -> Result<()> {
        if index >= self.len() {
            return Err(AutogradError::IndexOutOfBounds {
                index,
                dim_size: self.len(),
            });
        }
        self.data_mut()[index] = value;
        Ok(())
    }

    /// Validate cartesian indices and convert them to a linear index.
    pub fn linear_index(&self, indices: &[usize]) -> Result<usize> {
        if indices.len() != self.ndim() {
            return Err(AutogradError::WrongNumberOfIndices {
                expected: self.ndim(),
                actual: indices.len(),
            });
        }
        for (&idx, &dim) in indices.iter().zip(&self.shape) {
            if idx >= dim {
                return Err(AutogradError::IndexOutOfBounds {
                    index: idx,
                    dim_size: dim,
                });
            }
        }
        Ok(cartesian_to_linear(indices, &self.strides))
    }

    pub fn fill(&mut self, value: T) {
        for x in self.data_mut() {
            *x = value;
        }
    }

    /// Reshape to a new shape with the same element count, sharing storage.
    ///
    /// ```
    /// use ndgrad::DenseTensor;
    ///
    /// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// let flat = t.reshape(&[6]).unwrap();
    /// assert!(t.shares_storage_with(&flat));
    /// ```
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Self> {
        let new_len: usize = new_shape.iter().product();
        if new_len != self.len() {
            return Err(AutogradError::ShapeMismatch {
                expected: self.len(),
                actual: new_len,
            });
        }
        Ok(Self {
            data: Arc::clone(&self.data),
            shape: new_shape.to_vec(),
            strides: compute_strides(new_shape),
        })
    }

    /// Whether both tensors point at the same buffer.
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Whether another handle currently shares this buffer.
    pub fn is_view(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }

    /// Permute the dimensions; `perm[i]` is the source axis of result axis `i`.
    pub fn permutedims(&self, perm: &[usize]) -> Result<Self> {
        crate::operations::permutedims(self, perm)
    }

    /// Apply `f` to every element.
    pub fn map(&self, f: impl Fn(T) -> T) -> Self {
        Self {
            data: Arc::new(self.data.iter().map(|&x| f(x)).collect()),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
        }
    }
}
