/*
 * @Author       : 老董
 * @Date         : 2026-02-07
 * @Description  : 注意力层：以本步的查询向量对父网络中的编码序列`base:enc`（`[batch, T, d]`）做加权求和。
 *                 超出样本有效长度的位置被屏蔽；高斯窗注意力则以输入为位置，对其附近的窗口加权
 */

use std::f32::consts::PI;

use serde::{Deserialize, Serialize};

use super::{LayerStepOutput, RecLayerKind, StepInputs, all_known};
use crate::errors::{RecError, TensorError};
use crate::nn::{DataTemplate, Init, ParamStore};
use crate::tensor::Tensor;

/// 点积注意力：`e_t = q · k_t`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DotAttention {
    /// 编码序列的引用，如`"base:encoder"`
    pub base: String,
}

impl RecLayerKind for DotAttention {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        let Some(templates) = all_known(sources) else {
            return Ok(None);
        };
        let (query, base) = query_and_base(name, &templates)?;
        let d = encoder_dim(name, base)?;
        if query.shape != [d] {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: vec![d],
                got: query.shape.clone(),
            });
        }
        Ok(Some(DataTemplate::dense(name, d)))
    }

    fn extra_refs(&self) -> Vec<String> {
        vec![self.base.clone()]
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let query = inputs.source(0)?;
        let enc = inputs.source(1)?;
        let (rows, d) = (query.rows(), query.shape()[1]);
        // [rows, T, d] * [rows, 1, d] -> 沿d求和 -> [rows, T]
        let energies = enc.mul(&query.reshape(&[rows, 1, d])?)?.sum_axis(2)?;
        let context = attend(&energies, enc, inputs.seq_lens.get(1).and_then(Option::as_deref))?;
        Ok(LayerStepOutput::value(context))
    }
}

/// 拼接（加性）注意力：`e_t = v · tanh(q W_q + k_t W_k)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcatAttention {
    pub base: String,
    /// 注意力隐层宽度
    pub n_att: usize,
}

impl RecLayerKind for ConcatAttention {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        let Some(templates) = all_known(sources) else {
            return Ok(None);
        };
        let (_, base) = query_and_base(name, &templates)?;
        Ok(Some(DataTemplate::dense(name, encoder_dim(name, base)?)))
    }

    fn create_params(
        &self,
        name: &str,
        sources: &[&DataTemplate],
        _out: &DataTemplate,
        params: &mut ParamStore,
    ) -> Result<(), RecError> {
        let (query, base) = query_and_base(name, sources)?;
        let d_q = query.feature_dim().unwrap_or(1);
        let d = encoder_dim(name, base)?;
        params.create(&format!("{}/W_q", name), &[d_q, self.n_att], Init::Xavier)?;
        params.create(&format!("{}/W_k", name), &[d, self.n_att], Init::Xavier)?;
        params.create(&format!("{}/v", name), &[self.n_att, 1], Init::Xavier)?;
        Ok(())
    }

    fn extra_refs(&self) -> Vec<String> {
        vec![self.base.clone()]
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let query = inputs.source(0)?;
        let enc = inputs.source(1)?;
        let (rows, time, d) = (enc.shape()[0], enc.shape()[1], enc.shape()[2]);
        let a = self.n_att;
        let keys = enc
            .reshape(&[rows * time, d])?
            .mat_mul(inputs.param("W_k")?)?
            .reshape(&[rows, time, a])?;
        let q = query.mat_mul(inputs.param("W_q")?)?.reshape(&[rows, 1, a])?;
        let hidden = keys.add(&q)?.tanh().reshape(&[rows * time, a])?;
        let energies = hidden.mat_mul(inputs.param("v")?)?.reshape(&[rows, time])?;
        let context = attend(&energies, enc, inputs.seq_lens.get(1).and_then(Option::as_deref))?;
        Ok(LayerStepOutput::value(context))
    }
}

/// 高斯窗注意力：输入为`[]`或`[1]`的位置t，
/// 取编码序列中以round(t)为中心、宽`window_size`的窗口，第w帧的权重为`N(w; t, std)`。
/// 给定`inner_size`时在t附近按`inner_size_step`再取若干位置，输出`[inner_size, d]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaussWindowAttention {
    pub base: String,
    pub window_size: usize,
    #[serde(default = "default_std")]
    pub std: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_size: Option<usize>,
    #[serde(default = "default_inner_size_step")]
    pub inner_size_step: f32,
}

fn default_std() -> f32 {
    1.0
}

fn default_inner_size_step() -> f32 {
    0.5
}

impl GaussWindowAttention {
    /// 各位置相对t的偏移
    fn offsets(&self) -> Vec<f32> {
        match self.inner_size {
            Some(inner) => (0..inner)
                .map(|i| i as f32 * self.inner_size_step - inner as f32 / 2.0)
                .collect(),
            None => vec![0.0],
        }
    }
}

impl RecLayerKind for GaussWindowAttention {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        if self.window_size == 0 || self.std <= 0.0 || self.inner_size == Some(0) {
            return Err(RecError::Config(format!(
                "高斯窗注意力层`{}`的window_size、inner_size须大于0，std须为正",
                name
            )));
        }
        let Some(templates) = all_known(sources) else {
            return Ok(None);
        };
        let (location, base) = query_and_base(name, &templates)?;
        if !(location.shape.is_empty() || location.shape == [1]) {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: vec![1],
                got: location.shape.clone(),
            });
        }
        let d = encoder_dim(name, base)?;
        Ok(Some(match self.inner_size {
            Some(inner) => DataTemplate::with_shape(name, &[inner, d]),
            None => DataTemplate::dense(name, d),
        }))
    }

    fn extra_refs(&self) -> Vec<String> {
        vec![self.base.clone()]
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let location = inputs.source(0)?.data_as_vec();
        let enc = inputs.source(1)?;
        let (rows, time, d) = (enc.shape()[0], enc.shape()[1], enc.shape()[2]);
        if location.len() != rows {
            return Err(RecError::ShapeMismatch {
                layer: inputs.layer.to_string(),
                expected: vec![rows],
                got: vec![location.len()],
            });
        }
        let lens = inputs.seq_lens.get(1).and_then(Option::as_deref);
        let enc = enc.data_as_vec();
        let offsets = self.offsets();
        let norm = 1.0 / (self.std * (2.0 * PI).sqrt());

        let mut out = vec![0.0; rows * offsets.len() * d];
        for (r, &t) in location.iter().enumerate() {
            let len = lens.and_then(|l| l.get(r).copied()).unwrap_or(time).min(time);
            if len == 0 {
                continue;
            }
            let start = t.round_ties_even() as i64 - (self.window_size / 2) as i64;
            for w in 0..self.window_size {
                let idx = start + w as i64;
                // 窗口越界时取最近的有效帧，权重仍按未截断的位置计算
                let frame = idx.clamp(0, len as i64 - 1) as usize;
                let row = &enc[(r * time + frame) * d..(r * time + frame + 1) * d];
                for (j, off) in offsets.iter().enumerate() {
                    let diff = t + off - idx as f32;
                    let weight = (-diff * diff / (2.0 * self.std * self.std)).exp() * norm;
                    let at = (r * offsets.len() + j) * d;
                    let dst = &mut out[at..at + d];
                    for (o, v) in dst.iter_mut().zip(row) {
                        *o += weight * v;
                    }
                }
            }
        }
        let shape = match self.inner_size {
            Some(inner) => vec![rows, inner, d],
            None => vec![rows, d],
        };
        Ok(LayerStepOutput::value(Tensor::try_new(out, &shape)?))
    }
}

fn query_and_base<'a>(
    name: &str,
    templates: &[&'a DataTemplate],
) -> Result<(&'a DataTemplate, &'a DataTemplate), RecError> {
    match templates {
        [query, base] => Ok((*query, *base)),
        _ => Err(RecError::Config(format!(
            "注意力层`{}`须恰好有一个查询输入（from）和一个编码序列（base）",
            name
        ))),
    }
}

/// 编码序列描述为`[T, d]`，返回d
fn encoder_dim(name: &str, base: &DataTemplate) -> Result<usize, RecError> {
    match base.shape.as_slice() {
        [_, d] => Ok(*d),
        other => Err(RecError::Config(format!(
            "注意力层`{}`的编码序列须为`[batch, T, d]`，实际除批次外的形状为{:?}",
            name, other
        ))),
    }
}

/// 按长度屏蔽、softmax后对编码序列加权求和：
/// `energies [rows, T]`、`enc [rows, T, d]` -> `[rows, d]`。
/// 有效长度为0的行没有可关注的位置，上下文取全零
fn attend(energies: &Tensor, enc: &Tensor, seq_lens: Option<&[usize]>) -> Result<Tensor, RecError> {
    let (rows, time) = (energies.shape()[0], energies.shape()[1]);
    let energies = match seq_lens {
        Some(lens) => {
            if lens.len() != rows {
                return Err(TensorError::IndexOutOfRange {
                    index: lens.len(),
                    bound: rows,
                }
                .into());
            }
            let mask = lens
                .iter()
                .flat_map(|&len| {
                    (0..time).map(move |t| if t < len { 0.0 } else { f32::NEG_INFINITY })
                })
                .collect::<Vec<_>>();
            energies.add(&Tensor::try_new(mask, &[rows, time])?)?
        }
        None => energies.clone(),
    };
    let weights = energies.softmax_last().reshape(&[rows, time, 1])?;
    Ok(enc.mul(&weights)?.sum_axis(1)?)
}
