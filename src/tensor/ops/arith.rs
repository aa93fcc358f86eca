/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 逐元素的二元运算（遵循numpy风格的广播规则）
 */

use ndarray::{IxDyn, Zip};

use crate::errors::{Operator, TensorError};
use crate::tensor::Tensor;

/// 计算两个形状按numpy规则广播后的形状，不可广播时返回None
pub(crate) fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = a.len().max(b.len());
    let dim_at = |shape: &[usize], i: usize| {
        let offset = n - shape.len();
        if i < offset { 1 } else { shape[i - offset] }
    };
    (0..n)
        .map(|i| {
            let (da, db) = (dim_at(a, i), dim_at(b, i));
            match (da, db) {
                _ if da == db => Some(da),
                (1, _) => Some(db),
                (_, 1) => Some(da),
                _ => None,
            }
        })
        .collect()
}

impl Tensor {
    fn zip_with<F>(&self, other: &Tensor, operator: Operator, f: F) -> Result<Tensor, TensorError>
    where
        F: Fn(f32, f32) -> f32,
    {
        let err = || TensorError::OperatorError {
            operator,
            tensor1_shape: self.shape().to_vec(),
            tensor2_shape: other.shape().to_vec(),
        };
        let shape = broadcast_shape(self.shape(), other.shape()).ok_or_else(err)?;
        let a = self.data.broadcast(IxDyn(&shape)).ok_or_else(err)?;
        let b = other.data.broadcast(IxDyn(&shape)).ok_or_else(err)?;
        let data = Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y));
        Ok(Tensor { data })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, Operator::Add, |x, y| x + y)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, Operator::Sub, |x, y| x - y)
    }

    /// 逐元素相乘（Hadamard积）
    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, Operator::Mul, |x, y| x * y)
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        self.map(|x| x * factor)
    }

    pub fn add_scalar(&self, value: f32) -> Tensor {
        self.map(|x| x + value)
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Tensor {
            data: self.data.mapv(f),
        }
    }

    pub fn sum(&self) -> f32 {
        self.data.sum()
    }

    /// 沿`axis`求和（该维被消去）
    pub fn sum_axis(&self, axis: usize) -> Result<Tensor, TensorError> {
        if axis >= self.dimension() {
            return Err(TensorError::IndexOutOfRange {
                index: axis,
                bound: self.dimension(),
            });
        }
        Ok(Tensor {
            data: self.data.sum_axis(ndarray::Axis(axis)),
        })
    }
}
