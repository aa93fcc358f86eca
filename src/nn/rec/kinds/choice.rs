/*
 * @Author       : 老董
 * @Date         : 2026-02-07
 * @Description  : 选择点（choice point）：从D个候选中选出本步的输出标签。
 *                 训练/评估时直接输出目标标签（教师强制）；
 *                 束搜索时由实例化器调用[`Choice::log_scores`]并做top-K（见`search.rs`）；
 *                 回归型输入不是概率分布，搜索时原样输出输入
 */

use serde::{Deserialize, Serialize};

use super::{LayerStepOutput, RecLayerKind, StepInputs};
use crate::errors::RecError;
use crate::nn::DataTemplate;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChoiceInput {
    /// 输入为概率，取对数后作为分数
    #[default]
    Prob,
    LogProb,
    /// 输入即预测值本身，束宽只能为1
    Regression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub beam_size: usize,
    #[serde(default)]
    pub input_type: ChoiceInput,
}

impl Choice {
    /// 每行每个候选的对数分数`[rows, D]`
    pub fn log_scores(&self, input: &Tensor) -> Tensor {
        match self.input_type {
            ChoiceInput::Prob => input.ln(),
            ChoiceInput::LogProb | ChoiceInput::Regression => input.clone(),
        }
    }
}

impl RecLayerKind for Choice {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        if self.beam_size == 0 {
            return Err(RecError::Config(format!("选择层`{}`的beam_size须大于0", name)));
        }
        let Some(source) = sources.first().copied().flatten() else {
            return Ok(None);
        };
        if self.input_type == ChoiceInput::Regression {
            if self.beam_size != 1 {
                return Err(RecError::Config(format!(
                    "回归型选择层`{}`不做搜索，beam_size须为1，实际为{}",
                    name, self.beam_size
                )));
            }
            return Ok(Some(source.renamed(name)));
        }
        let dim = source
            .feature_dim()
            .filter(|_| !source.sparse && source.shape.len() == 1)
            .ok_or_else(|| RecError::Config(format!("选择层`{}`的输入须为`[D]`的分数", name)))?;
        Ok(Some(DataTemplate::sparse(name, dim)))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        // 有目标时按目标走，否则贪心地取分数最高者
        let value = match (inputs.target, self.input_type) {
            (Some(target), _) => target.clone(),
            (None, ChoiceInput::Regression) => inputs.source(0)?.clone(),
            (None, _) => Tensor::from_labels(&self.log_scores(inputs.source(0)?).argmax_rows()?),
        };
        Ok(LayerStepOutput::value(value))
    }

    fn beam_size(&self) -> Option<usize> {
        match self.input_type {
            ChoiceInput::Regression => None,
            _ => Some(self.beam_size),
        }
    }

    fn forced_by_target(&self) -> bool {
        true
    }
}
