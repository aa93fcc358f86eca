/*
 * @Author       : 老董
 * @Date         : 2026-02-05
 * @Description  : 不带参数的简单层：激活、拷贝（拼接）、合并、常量、比较
 */

use serde::{Deserialize, Serialize};

use super::{
    Activation, LayerStepOutput, RecLayerKind, StepInputs, all_known, dense_dim, dense_input,
};
use crate::errors::RecError;
use crate::nn::{DType, DataTemplate};
use crate::tensor::Tensor;

/// 对唯一输入逐元素（或沿最后一维）施加激活函数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationLayer {
    pub activation: Activation,
}

impl RecLayerKind for ActivationLayer {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        single_source(name, sources)
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        Ok(LayerStepOutput::value(self.activation.apply(inputs.source(0)?)))
    }
}

/// 单个输入时原样输出；多个输入时沿最后一维拼接
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CopyLayer {}

impl RecLayerKind for CopyLayer {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        if sources.len() == 1 {
            return single_source(name, sources);
        }
        Ok(all_known(sources).map(|templates| {
            let dim = templates.iter().map(|t| dense_dim(t)).sum();
            DataTemplate::dense(name, dim)
        }))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        if inputs.sources.len() == 1 {
            return Ok(LayerStepOutput::value(inputs.source(0)?.clone()));
        }
        let dense = inputs
            .sources
            .iter()
            .zip(&inputs.templates)
            .map(|(value, template)| dense_input(value, template))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LayerStepOutput::value(Tensor::concat_last(
            &dense.iter().collect::<Vec<_>>(),
        )?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKind {
    Add,
    Mul,
}

/// 多个同形输入逐元素相加/相乘
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Combine {
    pub kind: CombineKind,
}

impl RecLayerKind for Combine {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        let Some(templates) = all_known(sources) else {
            return Ok(None);
        };
        let first = templates
            .first()
            .ok_or_else(|| RecError::Config(format!("层`{}`至少需要一个输入", name)))?;
        if let Some(other) = templates.iter().find(|t| t.shape != first.shape) {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: first.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(Some(first.renamed(name).with_beam(None)))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let mut acc = inputs.source(0)?.clone();
        for x in inputs.sources.iter().skip(1) {
            acc = match self.kind {
                CombineKind::Add => acc.add(x)?,
                CombineKind::Mul => acc.mul(x)?,
            };
        }
        Ok(LayerStepOutput::value(acc))
    }
}

/// 每行输出同一个常量
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constant {
    pub value: f32,
    #[serde(default)]
    pub dtype: DType,
}

impl RecLayerKind for Constant {
    fn out_template(
        &self,
        name: &str,
        _sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        Ok(Some(DataTemplate::scalar(name, self.dtype)))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        Ok(LayerStepOutput::value(Tensor::full(self.value, &[inputs.rows])))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareKind {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl CompareKind {
    fn holds(&self, diff: f32) -> bool {
        match self {
            Self::Equal => diff == 0.0,
            Self::NotEqual => diff != 0.0,
            Self::Less => diff < 0.0,
            Self::LessEqual => diff <= 0.0,
            Self::Greater => diff > 0.0,
            Self::GreaterEqual => diff >= 0.0,
        }
    }
}

/// 比较层，输出布尔标志。常用来产生`end`信号，如“本步选中的标签等于EOS”：
/// ```json
/// { "class": "compare", "from": ["output"], "kind": "equal", "value": 0 }
/// ```
/// 只有一个输入时与`value`比较，两个输入时两两比较
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareLayer {
    pub kind: CompareKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
}

impl RecLayerKind for CompareLayer {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        match (sources.len(), self.value) {
            (1, Some(_)) | (2, None) => {}
            _ => {
                return Err(RecError::Config(format!(
                    "比较层`{}`须为一个输入加`value`，或两个输入",
                    name
                )));
            }
        }
        let Some(first) = sources.first().copied().flatten() else {
            return Ok(None);
        };
        Ok(Some(DataTemplate {
            name: name.to_string(),
            shape: first.shape.clone(),
            dim: None,
            dtype: DType::Bool,
            sparse: false,
            beam_size: None,
        }))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let lhs = inputs.source(0)?;
        let diff = match self.value {
            Some(v) => lhs.add_scalar(-v),
            None => lhs.sub(inputs.source(1)?)?,
        };
        let kind = self.kind;
        Ok(LayerStepOutput::value(
            diff.map(|d| if kind.holds(d) { 1.0 } else { 0.0 }),
        ))
    }
}

/// 唯一输入的描述原样沿用（改名）
fn single_source(
    name: &str,
    sources: &[Option<&DataTemplate>],
) -> Result<Option<DataTemplate>, RecError> {
    match sources {
        [source] => Ok(source.map(|t| t.renamed(name).with_beam(None))),
        _ => Err(RecError::Config(format!(
            "层`{}`须恰好有一个输入，实际为{}个",
            name,
            sources.len()
        ))),
    }
}
