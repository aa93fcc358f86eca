/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 与形状相关的方法：reshape、沿时间轴堆叠/拆分、拼接、切片、时间/批次轴交换等
 */

use std::ops::Range;

use ndarray::{Axis, IxDyn, Slice};

use super::Tensor;
use crate::errors::{ComparisonOperator, Operator, TensorError};

impl Tensor {
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor, TensorError> {
        Tensor::try_new(self.data_as_vec(), shape)
    }

    /// 将多个形状相同的张量沿新增的第0维堆叠，
    /// 如把每个时间步的`[batch, dim]`堆叠为`[time, batch, dim]`。
    /// `tensors`为空时返回`EmptyList`错误（需要空序列时请用[`Tensor::zeros`]自行构造）。
    pub fn stack(tensors: &[Tensor]) -> Result<Tensor, TensorError> {
        let first = tensors.first().ok_or(TensorError::EmptyList)?;
        if let Some(t) = tensors.iter().find(|t| !t.is_same_shape(first)) {
            return Err(TensorError::OperatorError {
                operator: Operator::Stack,
                tensor1_shape: first.shape().to_vec(),
                tensor2_shape: t.shape().to_vec(),
            });
        }
        let views = tensors.iter().map(|t| t.data.view()).collect::<Vec<_>>();
        let data = ndarray::stack(Axis(0), &views).map_err(|_| TensorError::InconsitentShape)?;
        Ok(Tensor { data })
    }

    /// `stack`的逆操作：沿第0维拆分
    pub fn unstack(&self) -> Vec<Tensor> {
        self.data
            .axis_iter(Axis(0))
            .map(|v| Tensor { data: v.to_owned() })
            .collect()
    }

    /// 沿第0维取出第`index`个切片（如时间主序序列中的某一帧）
    pub fn frame(&self, index: usize) -> Result<Tensor, TensorError> {
        let bound = self.rows();
        if self.dimension() == 0 || index >= bound {
            return Err(TensorError::IndexOutOfRange { index, bound });
        }
        Ok(Tensor {
            data: self.data.index_axis(Axis(0), index).to_owned(),
        })
    }

    /// 沿最后一维截取`[range.start, range.end)`，如从拼接的门控矩阵中取出某个门
    pub fn slice_last(&self, range: Range<usize>) -> Result<Tensor, TensorError> {
        let last = self.dimension().checked_sub(1).ok_or(TensorError::RankMismatch {
            expected: 1,
            shape: self.shape().to_vec(),
        })?;
        let bound = self.shape()[last];
        if range.end > bound || range.start > range.end {
            return Err(TensorError::IndexOutOfRange {
                index: range.end,
                bound,
            });
        }
        Ok(Tensor {
            data: self
                .data
                .slice_axis(Axis(last), Slice::from(range))
                .to_owned(),
        })
    }

    /// 沿最后一维拼接（除最后一维外其余维度须一致）
    pub fn concat_last(tensors: &[&Tensor]) -> Result<Tensor, TensorError> {
        let first = tensors.first().ok_or(TensorError::EmptyList)?;
        if tensors.len() == 1 {
            return Ok((*first).clone());
        }
        let last = first.dimension().checked_sub(1).ok_or(TensorError::RankMismatch {
            expected: 1,
            shape: first.shape().to_vec(),
        })?;
        let head = &first.shape()[..last];
        if let Some(t) = tensors
            .iter()
            .find(|t| t.dimension() != first.dimension() || &t.shape()[..last] != head)
        {
            return Err(TensorError::OperatorError {
                operator: Operator::Concat,
                tensor1_shape: first.shape().to_vec(),
                tensor2_shape: t.shape().to_vec(),
            });
        }
        let views = tensors.iter().map(|t| t.data.view()).collect::<Vec<_>>();
        let data = ndarray::concatenate(Axis(last), &views)
            .map_err(|_| TensorError::InconsitentShape)?;
        Ok(Tensor { data })
    }

    /// 交换第0维与第1维（批次主序与时间主序互转）
    pub fn swap_time_batch(&self) -> Result<Tensor, TensorError> {
        if self.dimension() < 2 {
            return Err(TensorError::ValueMustSatisfyComparison {
                value_name: "张量阶数".to_string(),
                operator: ComparisonOperator::GreaterOrEqual,
                threshold: 2,
                actual: self.dimension(),
            });
        }
        let mut axes = (0..self.dimension()).collect::<Vec<_>>();
        axes.swap(0, 1);
        let data = self
            .data
            .clone()
            .permuted_axes(IxDyn(&axes))
            .as_standard_layout()
            .to_owned();
        Ok(Tensor { data })
    }

    /// 对时间主序的序列`[time, batch, ...]`，在每个样本各自的有效长度内做时间反转，
    /// 超出长度的帧保持原位。
    pub fn reverse_within_lengths(&self, seq_lens: &[usize]) -> Result<Tensor, TensorError> {
        if self.dimension() < 2 || self.shape()[1] != seq_lens.len() {
            return Err(TensorError::RankMismatch {
                expected: 2,
                shape: self.shape().to_vec(),
            });
        }
        let time = self.rows();
        let mut data = self.data.clone();
        for (b, &len) in seq_lens.iter().enumerate() {
            let len = len.min(time);
            for t in 0..len {
                let src = self.data.index_axis(Axis(0), len - 1 - t);
                let src = src.index_axis(Axis(0), b);
                let mut dst = data.index_axis_mut(Axis(0), t);
                let mut dst = dst.index_axis_mut(Axis(0), b);
                dst.assign(&src);
            }
        }
        Ok(Tensor { data })
    }
}
