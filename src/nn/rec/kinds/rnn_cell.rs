/*
 * @Author       : 老董
 * @Date         : 2026-02-06
 * @Description  : 子网络中的单步循环单元层，附加循环状态存放在`"state"`中
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{LayerStepOutput, RecLayerKind, StepInputs, dense_dim, dense_input};
use crate::errors::RecError;
use crate::nn::rec::cells::{CellType, lookup_cell, resolve_cell};
use crate::nn::rec::config::{InitialSource, InitialValue};
use crate::nn::{DataTemplate, ParamStore};
use crate::tensor::Tensor;

pub(crate) const STATE_KEY: &str = "state";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RnnCell {
    pub unit: String,
    pub n_out: usize,
    /// 第0步之前的状态，只支持常量
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<InitialValue>,
}

impl RnnCell {
    fn cell_type(&self) -> Result<CellType, RecError> {
        resolve_cell(&self.unit)
            .map(|(_, cell)| cell.cell_type())
            .ok_or_else(|| RecError::UnknownCell(self.unit.clone()))
    }

    fn initial_constant(&self) -> Result<f32, RecError> {
        match self.initial_state.as_ref().map(InitialValue::source).transpose()? {
            None => Ok(0.0),
            Some(InitialSource::Constant(v)) => Ok(v),
            Some(InitialSource::Base(name)) => Err(RecError::Config(format!(
                "rnn_cell的initial_state不支持父网络层`base:{}`",
                name
            ))),
        }
    }
}

impl RecLayerKind for RnnCell {
    fn out_template(
        &self,
        name: &str,
        _sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError> {
        self.cell_type()?;
        self.initial_constant()?;
        Ok(Some(DataTemplate::dense(name, self.n_out)))
    }

    fn create_params(
        &self,
        name: &str,
        sources: &[&DataTemplate],
        _out: &DataTemplate,
        params: &mut ParamStore,
    ) -> Result<(), RecError> {
        let (_, cell) = lookup_cell(&self.unit)?;
        let n_in = sources.iter().map(|t| dense_dim(t)).sum::<usize>();
        cell.cell_type().create_params(name, n_in, self.n_out, params)
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError> {
        let cell = self.cell_type()?;
        let dense = inputs
            .sources
            .iter()
            .zip(&inputs.templates)
            .map(|(value, template)| dense_input(value, template))
            .collect::<Result<Vec<_>, _>>()?;
        let x = Tensor::concat_last(&dense.iter().collect::<Vec<_>>())?;
        let state = inputs
            .prev_extra
            .and_then(|extra| extra.get(STATE_KEY))
            .ok_or_else(|| RecError::MissingInput {
                layer: inputs.layer.to_string(),
                key: STATE_KEY.to_string(),
            })?;
        let x_proj = x.mat_mul(inputs.param("W")?)?.add(inputs.param("b")?)?;
        let (out, state) = cell.step(&x_proj, state, inputs.param("U")?, self.n_out)?;
        Ok(LayerStepOutput {
            value: out,
            extra: BTreeMap::from([(STATE_KEY.to_string(), state)]),
        })
    }

    fn initial_extra(
        &self,
        _out: &DataTemplate,
        rows: usize,
    ) -> Result<BTreeMap<String, Tensor>, RecError> {
        let size = self.cell_type()?.state_size(self.n_out);
        Ok(BTreeMap::from([(
            STATE_KEY.to_string(),
            Tensor::full(self.initial_constant()?, &[rows, size]),
        )]))
    }

    fn has_recurrent_state(&self) -> bool {
        true
    }
}

