/*
 * @Author       : 老董
 * @Date         : 2026-02-11
 * @Description  : 子网络中带损失的层：逐步计算每行的损失/错误，循环结束后按长度屏蔽并求和
 */

use std::collections::BTreeMap;

use serde::Serialize;

use super::config::LossKind;
use crate::errors::{RecError, TensorError};
use crate::nn::DataTemplate;
use crate::tensor::Tensor;

/// 概率的下限，避免`ln(0)`
const PROB_FLOOR: f32 = 1e-12;

/// 一步的损失`[rows]`与错误`[rows]`（mse没有错误率）
pub fn step_loss(
    kind: LossKind,
    value: &Tensor,
    target: &Tensor,
    target_template: &DataTemplate,
) -> Result<(Tensor, Option<Tensor>), RecError> {
    let rows = value.rows();
    match kind {
        LossKind::Ce => {
            let probs = as_rows(value)?;
            let dim = probs.shape()[1];
            let target = if target_template.sparse {
                target.one_hot(dim)?
            } else {
                as_rows(target)?
            };
            // -Σ t·ln(p)
            let log_probs = probs.map(|p| p.max(PROB_FLOOR).ln());
            let loss = target.mul(&log_probs)?.sum_axis(1)?.scale(-1.0);
            let predicted = probs.argmax_rows()?;
            let expected = target.argmax_rows()?;
            let error = predicted
                .iter()
                .zip(&expected)
                .map(|(p, e)| if p == e { 0.0 } else { 1.0 })
                .collect::<Vec<_>>();
            Ok((loss, Some(Tensor::try_new(error, &[rows])?)))
        }
        LossKind::Mse => {
            let target = if target_template.sparse {
                target.one_hot(value.size() / rows.max(1))?
            } else {
                target.clone()
            };
            let diff = as_rows(value)?.sub(&as_rows(&target)?)?;
            Ok((diff.mul(&diff)?.sum_axis(1)?, None))
        }
    }
}

/// 展平为`[rows, features]`
fn as_rows(value: &Tensor) -> Result<Tensor, TensorError> {
    let rows = value.rows();
    if rows == 0 {
        return value.reshape(&[0, 1]);
    }
    value.reshape(&[rows, value.size() / rows])
}

/// 按长度屏蔽后的总和：只计入`t < seq_lens[r]`的项
pub fn masked_sum(per_step: &[Tensor], seq_lens: &[usize]) -> f32 {
    per_step
        .iter()
        .enumerate()
        .map(|(t, values)| {
            values
                .data_as_vec()
                .iter()
                .zip(seq_lens)
                .filter(|(_, len)| t < **len)
                .map(|(v, _)| *v)
                .sum::<f32>()
        })
        .sum()
}

/// 一个损失层的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerLoss {
    /// 已乘`loss_scale`
    pub loss: f32,
    pub error: Option<f32>,
}

/// 整个循环层的损失汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossSummary {
    pub per_layer: BTreeMap<String, LayerLoss>,
    pub total_loss: f32,
    /// 按名字排序的最后一个损失层的错误
    pub error: Option<f32>,
    /// `1 / Σ长度`；总长度为0时为0
    pub norm_factor: f32,
}

impl LossSummary {
    pub fn new(per_layer: BTreeMap<String, LayerLoss>, seq_lens: &[usize]) -> Self {
        let total_loss = per_layer.values().map(|l| l.loss).sum();
        let error = per_layer.values().next_back().and_then(|l| l.error);
        let total_len = seq_lens.iter().sum::<usize>();
        let norm_factor = if total_len == 0 { 0.0 } else { 1.0 / total_len as f32 };
        Self {
            per_layer,
            total_loss,
            error,
            norm_factor,
        }
    }
}
