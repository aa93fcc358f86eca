/*
 * @Author       : 老董
 * @Date         : 2026-02-04
 * @Description  : 循环层所在的外层网络：网络级标志位与可被`base:`引用的父网络层
 */

use std::collections::BTreeMap;

use crate::errors::RecError;
use crate::nn::DataTemplate;
use crate::tensor::Tensor;

/// 网络级标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkFlags {
    pub train_flag: bool,
    /// 推理时做束搜索
    pub search_flag: bool,
    /// 收集损失与错误率
    pub eval_flag: bool,
}

impl NetworkFlags {
    pub fn training() -> Self {
        Self {
            train_flag: true,
            search_flag: false,
            eval_flag: true,
        }
    }

    pub fn eval() -> Self {
        Self {
            train_flag: false,
            search_flag: false,
            eval_flag: true,
        }
    }

    pub fn search() -> Self {
        Self {
            train_flag: false,
            search_flag: true,
            eval_flag: false,
        }
    }
}

/// 父网络中已计算好的一层
#[derive(Debug, Clone)]
pub struct BaseLayer {
    pub template: DataTemplate,
    /// 批次主序：`[batch, ...]`（如编码器输出为`[batch, time, dim]`）
    pub value: Tensor,
    /// 若`value`带时间维，则为逐样本有效长度
    pub seq_lens: Option<Vec<usize>>,
    /// 若该层是固定单元的循环层，可携带其最终隐藏状态
    pub last_hidden_state: Option<Tensor>,
}

impl BaseLayer {
    /// 由值推出描述符（除批次维外的形状）
    pub fn new(name: &str, value: Tensor) -> Self {
        let template = DataTemplate::with_shape(name, &value.shape()[1..]);
        Self {
            template,
            value,
            seq_lens: None,
            last_hidden_state: None,
        }
    }

    /// 带时间维的层（如编码器），`seq_lens`用于注意力的掩码
    pub fn with_seq_lens(name: &str, value: Tensor, seq_lens: Vec<usize>) -> Self {
        Self {
            seq_lens: Some(seq_lens),
            ..Self::new(name, value)
        }
    }

    /// 附上固定单元循环层的最终隐藏状态`[batch, state_size]`
    pub fn with_last_hidden_state(mut self, state: Tensor) -> Self {
        self.last_hidden_state = Some(state);
        self
    }

    pub fn batch(&self) -> usize {
        self.value.rows()
    }

    /// 取最终隐藏状态，`layer`为引用它的层
    pub fn hidden_state(&self, layer: &str) -> Result<&Tensor, RecError> {
        self.last_hidden_state.as_ref().ok_or_else(|| {
            RecError::Unsupported(format!(
                "层`{}`引用的父网络层`{}`没有最终隐藏状态",
                layer, self.template.name
            ))
        })
    }
}

/// 父网络：循环层可见的外部层集合
#[derive(Debug, Clone, Default)]
pub struct ParentNetwork {
    /// 显式指定批大小（没有任何逐步输入时需要）
    pub batch_dim: Option<usize>,
    layers: BTreeMap<String, BaseLayer>,
}

impl ParentNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_dim(batch_dim: usize) -> Self {
        Self {
            batch_dim: Some(batch_dim),
            ..Self::default()
        }
    }

    pub fn add_layer(&mut self, name: &str, layer: BaseLayer) {
        self.layers.insert(name.to_string(), layer);
    }

    pub fn with_layer(mut self, name: &str, layer: BaseLayer) -> Self {
        self.add_layer(name, layer);
        self
    }

    pub fn get_layer(&self, name: &str) -> Option<&BaseLayer> {
        self.layers.get(name)
    }

    /// 取父网络层，不存在时报`UnknownLayer`
    pub fn require(&self, layer: &str, name: &str) -> Result<&BaseLayer, RecError> {
        self.get_layer(name).ok_or_else(|| RecError::UnknownLayer {
            layer: layer.to_string(),
            reference: format!("base:{}", name),
        })
    }

    pub fn layers(&self) -> impl Iterator<Item = (&String, &BaseLayer)> {
        self.layers.iter()
    }
}
