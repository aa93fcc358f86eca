/*
 * @Author       : 老董
 * @Date         : 2026-02-05
 * @Description  : 循环层的声明式配置（可由JSON反序列化）
 *
 * 单元（unit）要么是固定的循环单元名：
 * ```json
 * { "unit": "lstm", "n_out": 8 }
 * ```
 * 要么是一个子网络（层名 -> 层描述）：
 * ```json
 * {
 *   "unit": {
 *     "state":  { "class": "linear", "from": ["data:source", "prev:state"], "n_out": 4, "activation": "tanh" },
 *     "output": { "class": "copy", "from": ["state"] }
 *   }
 * }
 * ```
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use super::kinds::LayerKind;
use crate::errors::RecError;

/// 单元声明
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitDesc {
    Cell(String),
    Subnetwork(BTreeMap<String, LayerDesc>),
}

/// 子网络中一层的描述
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerDesc {
    #[serde(flatten)]
    pub kind: LayerKind,
    /// 依赖引用：`x`（同一步）、`prev:x`（上一步）、`base:x`（父网络）、
    /// `data:key`（外部数据）、`:i`（步号）
    #[serde(default, deserialize_with = "one_or_many")]
    pub from: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<LossKind>,
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f32,
    /// 损失/教师强制（teacher forcing）所用的外部数据键；缺省时用循环层的`target`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// 作为`prev:`被引用时第0步的取值；缺省为全0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_output: Option<InitialValue>,
}

impl LayerDesc {
    pub fn from_json(value: serde_json::Value) -> Result<Self, RecError> {
        serde_json::from_value(value).map_err(|e| RecError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    /// 交叉熵，输入为概率
    Ce,
    Mse,
}

/// 初始值：数值常量、`"zeros"`、`"ones"`或父网络层`"base:x"`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InitialValue {
    Constant(f32),
    Named(String),
}

/// 解析后的初始值来源
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum InitialSource<'a> {
    Constant(f32),
    Base(&'a str),
}

impl InitialValue {
    pub(crate) fn source(&self) -> Result<InitialSource<'_>, RecError> {
        match self {
            Self::Constant(v) => Ok(InitialSource::Constant(*v)),
            Self::Named(name) => match name.as_str() {
                "zeros" => Ok(InitialSource::Constant(0.0)),
                "ones" => Ok(InitialSource::Constant(1.0)),
                other => other
                    .strip_prefix("base:")
                    .map(InitialSource::Base)
                    .ok_or_else(|| RecError::Config(format!("无法识别的初始值`{}`", other))),
            },
        }
    }
}

/// 循环层配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecLayerConfig {
    pub unit: UnitDesc,
    /// 输出维度；固定单元必须给出，子网络给出时用于校验`output`层
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_out: Option<usize>,
    /// 序列长度事先未知时的最大步数
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_seq_len: Option<usize>,
    /// `1`为正向，`-1`为在各样本有效长度内反向
    #[serde(default = "default_direction")]
    pub direction: i32,
    /// 固定单元的初始隐藏状态
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_state: Option<InitialValue>,
    /// 默认的目标数据键
    #[serde(default = "default_target")]
    pub target: String,
    /// 是否把不依赖逐步状态的层移出循环
    #[serde(default = "default_true")]
    pub optimize_move_layers_out: bool,
    /// 仅多层融合单元使用
    #[serde(default = "default_num_layers")]
    pub num_layers: usize,
}

impl RecLayerConfig {
    pub fn from_json(value: serde_json::Value) -> Result<Self, RecError> {
        serde_json::from_value(value).map_err(|e| RecError::Config(e.to_string()))
    }

    pub fn cell(unit: &str, n_out: usize) -> Self {
        Self {
            unit: UnitDesc::Cell(unit.to_string()),
            n_out: Some(n_out),
            max_seq_len: None,
            direction: default_direction(),
            initial_state: None,
            target: default_target(),
            optimize_move_layers_out: true,
            num_layers: default_num_layers(),
        }
    }
}

fn default_loss_scale() -> f32 {
    1.0
}

fn default_direction() -> i32 {
    1
}

fn default_target() -> String {
    "classes".to_string()
}

fn default_true() -> bool {
    true
}

fn default_num_layers() -> usize {
    1
}

/// `"from"`既可以是单个字符串也可以是字符串列表
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
