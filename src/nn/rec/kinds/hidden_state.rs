/*
 * @Author       : 老董
 * @Date         : 2026-02-15
 * @Description  : 读取父网络中固定单元循环层的最终隐藏状态，多个时拼接或相加。
 *                 常用于用编码器的最终状态初始化解码器
 */

use serde::{Deserialize, Serialize};

use super::{LayerStepOutput, RecLayerKind, StepInputs, all_known, dense_dim};
use crate::errors::RecError;
use crate::nn::DataTemplate;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenStateCombine {
    #[default]
    Concat,
    Add,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLastHiddenState {
    pub n_out: usize,
    #[serde(default)]
    pub combine: HiddenStateCombine,
}

impl RecLayerKind for GetLastHiddenState {
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        let Some(templates) = all_known(sources) else {
            return Ok(None);
        };
        let dims = templates.iter().map(|t| dense_dim(t)).collect::<Vec<_>>();
        let Some(&first) = dims.first() else {
            return Err(RecError::Config(format!("层`{}`至少需要一个输入", name)));
        };
        let got = match self.combine {
            HiddenStateCombine::Concat => dims.iter().sum(),
            HiddenStateCombine::Add => match dims.iter().find(|&&d| d != first) {
                Some(&d) => {
                    return Err(RecError::ShapeMismatch {
                        layer: name.to_string(),
                        expected: vec![first],
                        got: vec![d],
                    });
                }
                None => first,
            },
        };
        if got != self.n_out {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: vec![self.n_out],
                got: vec![got],
            });
        }
        Ok(Some(DataTemplate::dense(name, self.n_out)))
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let value = match (inputs.sources.as_slice(), self.combine) {
            ([single], _) => (*single).clone(),
            (sources, HiddenStateCombine::Concat) => Tensor::concat_last(sources)?,
            (sources, HiddenStateCombine::Add) => {
                let mut sum = inputs.source(0)?.clone();
                for state in &sources[1..] {
                    sum = sum.add(state)?;
                }
                sum
            }
        };
        Ok(LayerStepOutput::value(value))
    }

    fn reads_last_hidden_state(&self) -> bool {
        true
    }
}
