/*
 * @Author       : 老董
 * @Date         : 2026-02-05
 * @Description  : 全连接层：`y = act(concat(x_1, ..., x_n) W + b)`。
 *                 稀疏输入（类别索引）先转成one-hot再参与拼接
 */

use serde::{Deserialize, Serialize};

use super::{LayerStepOutput, RecLayerKind, StepInputs, dense_dim, dense_input};
use crate::errors::RecError;
use crate::nn::{DataTemplate, Init, ParamStore};
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Tanh,
    Sigmoid,
    Relu,
    Softmax,
    LogSoftmax,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Self::Identity => x.clone(),
            Self::Tanh => x.tanh(),
            Self::Sigmoid => x.sigmoid(),
            Self::Relu => x.relu(),
            Self::Softmax => x.softmax_last(),
            Self::LogSoftmax => x.log_softmax_last(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub n_out: usize,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default = "default_with_bias")]
    pub with_bias: bool,
}

fn default_with_bias() -> bool {
    true
}

impl RecLayerKind for Linear {
    fn out_template(
        &self,
        name: &str,
        _sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        // 输出形状只取决于n_out，因此即便输入里有尚未推出的`prev:`自引用也能确定
        Ok(Some(DataTemplate::dense(name, self.n_out)))
    }

    fn create_params(
        &self,
        name: &str,
        sources: &[&DataTemplate],
        _out: &DataTemplate,
        params: &mut ParamStore,
    ) -> Result<(), RecError> {
        if sources.is_empty() {
            return Err(RecError::Config(format!("层`{}`至少需要一个输入", name)));
        }
        let n_in = sources.iter().map(|t| dense_dim(t)).sum::<usize>();
        params.create(&format!("{}/W", name), &[n_in, self.n_out], Init::Xavier)?;
        if self.with_bias {
            params.create(&format!("{}/b", name), &[self.n_out], Init::Zeros)?;
        }
        Ok(())
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let dense = inputs
            .sources
            .iter()
            .zip(&inputs.templates)
            .map(|(value, template)| dense_input(value, template))
            .collect::<Result<Vec<_>, _>>()?;
        let x = Tensor::concat_last(&dense.iter().collect::<Vec<_>>())?;
        let mut y = x.mat_mul(inputs.param("W")?)?;
        if self.with_bias {
            y = y.add(inputs.param("b")?)?;
        }
        Ok(LayerStepOutput::value(self.activation.apply(&y)))
    }
}

