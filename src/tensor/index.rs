/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 按行索引相关的方法：gather、tile、按行选择、one-hot、argmax、top-k。
 *                 束搜索（beam search）中的“按父束位重排”全部建立在这里的`gather_rows`之上
 */

use std::cmp::Ordering;

use ndarray::{Axis, Ix2};

use super::Tensor;
use crate::errors::{ComparisonOperator, Operator, TensorError};

impl Tensor {
    /// 沿第0维按`indices`取行，返回`[indices.len(), ...]`
    pub fn gather_rows(&self, indices: &[usize]) -> Result<Tensor, TensorError> {
        let bound = self.rows();
        if self.dimension() == 0 {
            return Err(TensorError::RankMismatch {
                expected: 1,
                shape: vec![],
            });
        }
        if let Some(&index) = indices.iter().find(|&&i| i >= bound) {
            return Err(TensorError::IndexOutOfRange { index, bound });
        }
        Ok(Tensor {
            data: self.data.select(Axis(0), indices),
        })
    }

    /// 每一行连续重复`times`次：`[batch, ...] -> [batch*times, ...]`，
    /// 第`b`行展开后位于`b*times..(b+1)*times`（即束维在内、批次维在外）
    pub fn tile_rows(&self, times: usize) -> Result<Tensor, TensorError> {
        if times == 1 {
            return Ok(self.clone());
        }
        let indices = (0..self.rows())
            .flat_map(|r| std::iter::repeat(r).take(times))
            .collect::<Vec<_>>();
        self.gather_rows(&indices)
    }

    /// 按行选择：`mask[r]`为真取`on_true`的第r行，否则取`on_false`的第r行
    pub fn where_rows(
        mask: &[bool],
        on_true: &Tensor,
        on_false: &Tensor,
    ) -> Result<Tensor, TensorError> {
        if !on_true.is_same_shape(on_false) || on_true.rows() != mask.len() {
            return Err(TensorError::OperatorError {
                operator: Operator::Where,
                tensor1_shape: on_true.shape().to_vec(),
                tensor2_shape: on_false.shape().to_vec(),
            });
        }
        let mut data = on_false.data.clone();
        for (r, _) in mask.iter().enumerate().filter(|(_, m)| **m) {
            data.index_axis_mut(Axis(0), r)
                .assign(&on_true.data.index_axis(Axis(0), r));
        }
        Ok(Tensor { data })
    }

    /// 将`[rows]`的类别索引转为`[rows, depth]`的one-hot矩阵
    pub fn one_hot(&self, depth: usize) -> Result<Tensor, TensorError> {
        let labels = self.to_labels();
        let mut data = vec![0.0; labels.len() * depth];
        for (r, &label) in labels.iter().enumerate() {
            if label >= depth {
                return Err(TensorError::IndexOutOfRange {
                    index: label,
                    bound: depth,
                });
            }
            data[r * depth + label] = 1.0;
        }
        Tensor::try_new(data, &[labels.len(), depth])
    }

    /// 二维张量每行的最大值下标（并列时取最小下标）
    pub fn argmax_rows(&self) -> Result<Vec<usize>, TensorError> {
        let matrix = self.as_matrix()?;
        Ok(matrix
            .rows()
            .into_iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                        if v > bv { (i, v) } else { (bi, bv) }
                    })
                    .0
            })
            .collect())
    }

    /// 二维张量每行取分数最高的`k`个元素，返回`(分数[rows, k], 下标)`。
    ///
    /// 排序是全序且稳定的：分数高者在前，分数相同（含同为`-inf`）时下标小者在前，
    /// 因此同样的输入永远得到同样的结果。
    /// `reserved`按元素展平（可为空），其中标记的有限值先占名额，剩余名额再按分数竞争
    pub fn top_k_rows(
        &self,
        k: usize,
        reserved: &[bool],
    ) -> Result<(Tensor, Vec<Vec<usize>>), TensorError> {
        let matrix = self.as_matrix()?;
        let cols = matrix.ncols();
        if k > cols {
            return Err(TensorError::ValueMustSatisfyComparison {
                value_name: "k".to_string(),
                operator: ComparisonOperator::LessOrEqual,
                threshold: cols,
                actual: k,
            });
        }
        let mut scores = Vec::with_capacity(matrix.nrows() * k);
        let mut indices = Vec::with_capacity(matrix.nrows());
        for (r, row) in matrix.rows().into_iter().enumerate() {
            let by_score = |a: &usize, b: &usize| match row[*b].total_cmp(&row[*a]) {
                Ordering::Equal => a.cmp(b),
                other => other,
            };
            let is_reserved = |i: usize| reserved.get(r * cols + i).copied().unwrap_or(false);
            let (mut order, mut rest): (Vec<usize>, Vec<usize>) =
                (0..cols).partition(|&i| is_reserved(i) && row[i].is_finite());
            order.sort_by(by_score);
            order.truncate(k);
            rest.sort_by(by_score);
            rest.truncate(k - order.len());
            order.extend(rest);
            order.sort_by(by_score);
            scores.extend(order.iter().map(|&i| row[i]));
            indices.push(order);
        }
        Ok((Tensor::try_new(scores, &[matrix.nrows(), k])?, indices))
    }

    fn as_matrix(&self) -> Result<ndarray::ArrayView2<'_, f32>, TensorError> {
        self.data
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| TensorError::RankMismatch {
                expected: 2,
                shape: self.shape().to_vec(),
            })
    }
}
