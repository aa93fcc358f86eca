/*
 * @Author       : 老董
 * @Date         : 2026-02-05
 * @Description  : 子网络中可用的层类型（封闭集合），经enum_dispatch统一分发。
 *                 每种层只负责自己“单步”的数值公式；
 *                 按依赖顺序调度、跨步传递状态、束的重排等都由实例化器负责
 */

mod attention;
mod choice;
mod elementwise;
mod hidden_state;
mod linear;
mod rnn_cell;

pub use attention::{ConcatAttention, DotAttention, GaussWindowAttention};
pub use choice::{Choice, ChoiceInput};
pub use elementwise::{
    ActivationLayer, Combine, CombineKind, CompareKind, CompareLayer, Constant, CopyLayer,
};
pub use hidden_state::{GetLastHiddenState, HiddenStateCombine};
pub use linear::{Activation, Linear};
pub use rnn_cell::RnnCell;
pub(crate) use rnn_cell::STATE_KEY;

use std::collections::BTreeMap;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::errors::{RecError, TensorError};
use crate::nn::{DataTemplate, NetworkFlags, ParamStore};
use crate::tensor::Tensor;

#[enum_dispatch]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum LayerKind {
    Linear(Linear),
    Activation(ActivationLayer),
    Copy(CopyLayer),
    Combine(Combine),
    Constant(Constant),
    Compare(CompareLayer),
    RnnCell(RnnCell),
    Choice(Choice),
    DotAttention(DotAttention),
    ConcatAttention(ConcatAttention),
    GaussWindowAttention(GaussWindowAttention),
    GetLastHiddenState(GetLastHiddenState),
}

/// 单步计算时绑定好的输入。
/// `sources`与层的依赖顺序一致（先`from`，后[`RecLayerKind::extra_refs`]），
/// 且都已对齐到同一组行（batch或batch*beam）
pub struct StepInputs<'a> {
    pub layer: &'a str,
    pub sources: Vec<&'a Tensor>,
    pub templates: Vec<&'a DataTemplate>,
    /// 带时间维的输入（父网络层）逐行的有效长度
    pub seq_lens: Vec<Option<Vec<usize>>>,
    pub out: &'a DataTemplate,
    pub params: &'a ParamStore,
    /// 本层上一步的附加循环状态
    pub prev_extra: Option<&'a BTreeMap<String, Tensor>>,
    /// 本步的目标（教师强制时）
    pub target: Option<&'a Tensor>,
    pub flags: NetworkFlags,
    pub rows: usize,
    pub step: usize,
}

impl StepInputs<'_> {
    pub fn source(&self, index: usize) -> Result<&Tensor, RecError> {
        self.sources.get(index).copied().ok_or_else(|| {
            RecError::Config(format!("层`{}`缺少第{}个输入", self.layer, index))
        })
    }

    pub fn param(&self, suffix: &str) -> Result<&Tensor, RecError> {
        self.params.get(&format!("{}/{}", self.layer, suffix))
    }
}

/// 单步计算结果
#[derive(Debug, Clone)]
pub struct LayerStepOutput {
    pub value: Tensor,
    /// 附加循环状态（如单元的记忆）
    pub extra: BTreeMap<String, Tensor>,
}

impl LayerStepOutput {
    pub fn value(value: Tensor) -> Self {
        Self {
            value,
            extra: BTreeMap::new(),
        }
    }
}

#[enum_dispatch(LayerKind)]
pub trait RecLayerKind {
    /// 由输入描述推出输出描述。
    /// 某个输入尚未推出（`None`，如对自身的`prev:`引用）且本层离不开它时返回`Ok(None)`
    fn out_template(
        &self,
        name: &str,
        sources: &[Option<&DataTemplate>],
    ) -> Result<Option<DataTemplate>, RecError>;

    /// 创建参数，参数名以`<层名>/`为前缀
    fn create_params(
        &self,
        _name: &str,
        _sources: &[&DataTemplate],
        _out: &DataTemplate,
        _params: &mut ParamStore,
    ) -> Result<(), RecError> {
        Ok(())
    }

    /// `from`之外的依赖（如注意力所用的编码器`base:enc`）
    fn extra_refs(&self) -> Vec<String> {
        Vec::new()
    }

    fn step(&self, inputs: &StepInputs<'_>) -> Result<LayerStepOutput, RecError>;

    /// 第0步之前的附加循环状态
    fn initial_extra(
        &self,
        _out: &DataTemplate,
        _rows: usize,
    ) -> Result<BTreeMap<String, Tensor>, RecError> {
        Ok(BTreeMap::new())
    }

    /// 是否带有跨步的附加状态（这样的层不能被移出循环）
    fn has_recurrent_state(&self) -> bool {
        false
    }

    /// 选择点（choice point）的束宽
    fn beam_size(&self) -> Option<usize> {
        None
    }

    /// 非搜索时是否直接输出目标（教师强制）
    fn forced_by_target(&self) -> bool {
        self.beam_size().is_some()
    }

    /// 为真时`base:`输入绑定的是父网络层的最终隐藏状态，而非其输出
    fn reads_last_hidden_state(&self) -> bool {
        false
    }
}

/// 所有输入都已推出时返回它们，否则返回None
pub(crate) fn all_known<'a>(sources: &[Option<&'a DataTemplate>]) -> Option<Vec<&'a DataTemplate>> {
    sources.iter().copied().collect()
}

/// 把一个输入转成`[rows, dim]`的稠密矩阵：稀疏（类别索引）转one-hot，标量转单列
pub(crate) fn dense_input(value: &Tensor, template: &DataTemplate) -> Result<Tensor, RecError> {
    if template.sparse {
        let dim = template
            .dim
            .ok_or_else(|| RecError::Config(format!("稀疏数据`{}`缺少dim", template.name)))?;
        return Ok(value.one_hot(dim)?);
    }
    match value.dimension() {
        1 => Ok(value.reshape(&[value.rows(), 1])?),
        2 => Ok(value.clone()),
        _ => Err(TensorError::RankMismatch {
            expected: 2,
            shape: value.shape().to_vec(),
        }
        .into()),
    }
}

/// 作为稠密输入时的特征维度（标量按1列计）
pub(crate) fn dense_dim(template: &DataTemplate) -> usize {
    template.feature_dim().unwrap_or(1)
}
