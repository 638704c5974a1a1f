//! Dense tensor payloads.

use std::ops::Range;

use crate::error::{AutogradError, Result};
use crate::operations;
use crate::payload::Payload;
use crate::scalar::Scalar;
use crate::size::Size;
use crate::tensor::DenseTensor;

impl<T: Scalar> Payload for DenseTensor<T> {
    const BACKEND: &'static str = "dense";

    fn size(&self) -> Size {
        Size::new(self.shape())
    }

    fn numel(&self) -> usize {
        self.len()
    }

    fn zeros(size: &Size) -> Self {
        DenseTensor::zeros(size.dims())
    }

    fn ones(size: &Size) -> Self {
        DenseTensor::ones(size.dims())
    }

    fn full(size: &Size, value: f64) -> Self {
        DenseTensor::full(size.dims(), T::from_f64(value))
    }

    fn add(&self, rhs: &Self) -> Result<Self> {
        operations::zip_broadcast(self, rhs, |a, b| a + b)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        operations::zip_broadcast(self, rhs, |a, b| a - b)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        operations::zip_broadcast(self, rhs, |a, b| a * b)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        operations::zip_broadcast(self, rhs, |a, b| a / b)
    }

    fn matmul(&self, rhs: &Self) -> Result<Self> {
        operations::matmul(self, rhs)
    }

    fn neg(&self) -> Self {
        self.map(|x| -x)
    }

    fn relu(&self) -> Self {
        operations::relu(self)
    }

    fn sigmoid(&self) -> Self {
        operations::sigmoid(self)
    }

    fn exp(&self) -> Self {
        self.map(Scalar::exp)
    }

    fn log(&self) -> Self {
        self.map(Scalar::ln)
    }

    fn transpose(&self) -> Result<Self> {
        operations::transpose_last2(self)
    }

    fn reshape(&self, size: &Size) -> Result<Self> {
        DenseTensor::reshape(self, size.dims())
    }

    fn sum(&self) -> Self {
        DenseTensor::scalar(operations::sum(self))
    }

    fn mean(&self) -> Self {
        DenseTensor::scalar(operations::mean(self))
    }

    fn norm(&self) -> Self {
        DenseTensor::scalar(operations::norm(self))
    }

    fn argmax(&self) -> Option<usize> {
        operations::argmax(self)
    }

    fn threshold(&self, threshold: f64) -> Self {
        operations::threshold(self, T::from_f64(threshold))
    }

    fn scale(&self, alpha: f64) -> Self {
        operations::scale(self, T::from_f64(alpha))
    }

    fn sum_to(&self, size: &Size) -> Result<Self> {
        operations::sum_to(self, size.dims())
    }

    fn broadcast_to(&self, size: &Size) -> Result<Self> {
        operations::broadcast_to(self, size.dims())
    }

    fn get(&self, index: usize) -> Result<f64> {
        self.get_linear(index)
            .map(|&x| x.to_f64())
            .ok_or(AutogradError::IndexOutOfBounds {
                index,
                dim_size: self.len(),
            })
    }

    fn put(&mut self, index: usize, value: f64) -> Result<()> {
        self.set_linear(index, T::from_f64(value))
    }

    fn get_at(&self, indices: &[usize]) -> Result<f64> {
        let linear = self.linear_index(indices)?;
        Ok(self.data()[linear].to_f64())
    }

    fn put_at(&mut self, indices: &[usize], value: f64) -> Result<()> {
        self.set(indices, T::from_f64(value))
    }

    fn slice(&self, ranges: &[Range<usize>]) -> Result<Self> {
        operations::slice(self, ranges)
    }

    fn put_slice(&mut self, ranges: &[Range<usize>], values: &Self) -> Result<()> {
        operations::slice_assign(self, ranges, values)
    }

    fn to_vec(&self) -> Vec<f64> {
        self.data().iter().map(|x| x.to_f64()).collect()
    }
}
