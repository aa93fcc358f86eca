/*
 * @Author       : 老董
 * @Date         : 2026-02-04
 * @Description  : 数据描述符（DataTemplate）与外部数据（extern data）
 *
 * `DataTemplate`只描述“某一时间步上一行数据”的形状/类型，不含批次维与时间维；
 * 真实的张量在其前面加上“行”维（batch或batch*beam）。
 * `SeqData`则是时间主序的整段序列`[time, batch, ...]`加上逐样本的有效长度。
 */

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{RecError, TensorError};
use crate::tensor::Tensor;

/// 元素类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    #[default]
    Float32,
    Int32,
    Bool,
}

/// 层输出（或外部数据某一帧）的描述符
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTemplate {
    pub name: String,
    /// 除行维外的形状。稀疏数据（类别索引）与标量为`[]`
    pub shape: Vec<usize>,
    /// 特征维度；稀疏数据为类别数
    pub dim: Option<usize>,
    pub dtype: DType,
    pub sparse: bool,
    /// 若为搜索假设（hypothesis）的载体，则为对应的束宽
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beam_size: Option<usize>,
}

impl DataTemplate {
    /// 稠密特征`[dim]`
    pub fn dense(name: &str, dim: usize) -> Self {
        Self::with_shape(name, &[dim])
    }

    /// 任意形状的稠密数据，`dim`取最后一维
    pub fn with_shape(name: &str, shape: &[usize]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
            dim: shape.last().copied(),
            dtype: DType::Float32,
            sparse: false,
            beam_size: None,
        }
    }

    /// 类别索引，每行一个整数，取值范围`[0, dim)`
    pub fn sparse(name: &str, dim: usize) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![],
            dim: Some(dim),
            dtype: DType::Int32,
            sparse: true,
            beam_size: None,
        }
    }

    /// 每行一个布尔标志
    pub fn flag(name: &str) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![],
            dim: None,
            dtype: DType::Bool,
            sparse: false,
            beam_size: None,
        }
    }

    /// 每行一个标量
    pub fn scalar(name: &str, dtype: DType) -> Self {
        Self {
            name: name.to_string(),
            shape: vec![],
            dim: None,
            dtype,
            sparse: false,
            beam_size: None,
        }
    }

    pub fn renamed(&self, name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..self.clone()
        }
    }

    pub fn with_beam(mut self, beam_size: Option<usize>) -> Self {
        self.beam_size = beam_size;
        self
    }

    /// 作为稠密输入时的特征维度（稀疏数据按one-hot计）
    pub fn feature_dim(&self) -> Option<usize> {
        if self.sparse {
            self.dim
        } else {
            self.shape.last().copied()
        }
    }

    /// 带`rows`行时的张量形状
    pub fn value_shape(&self, rows: usize) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(rows);
        shape.extend_from_slice(&self.shape);
        shape
    }

    /// 校验真实值与声明是否一致
    pub fn check_value(&self, layer: &str, value: &Tensor, rows: usize) -> Result<(), RecError> {
        let expected = self.value_shape(rows);
        if value.shape() != expected.as_slice() {
            return Err(RecError::ShapeMismatch {
                layer: layer.to_string(),
                expected,
                got: value.shape().to_vec(),
            });
        }
        Ok(())
    }
}

/// 一段时间主序的序列数据`[time, batch, ...]`及逐样本有效长度
#[derive(Debug, Clone, PartialEq)]
pub struct SeqData {
    data: Tensor,
    seq_lens: Vec<usize>,
    sparse_dim: Option<usize>,
}

impl SeqData {
    /// `data`为`[time, batch, ...]`，`seq_lens`长度须等于batch
    pub fn new(data: Tensor, seq_lens: Vec<usize>) -> Result<Self, RecError> {
        if data.dimension() < 2 {
            return Err(TensorError::RankMismatch {
                expected: 2,
                shape: data.shape().to_vec(),
            }
            .into());
        }
        let (time, batch) = (data.shape()[0], data.shape()[1]);
        if seq_lens.len() != batch {
            return Err(RecError::LengthMismatch {
                expected: batch,
                got: seq_lens.len(),
                message: "seq_lens的个数须等于批大小".to_string(),
            });
        }
        if let Some(&len) = seq_lens.iter().find(|&&l| l > time) {
            return Err(RecError::LengthMismatch {
                expected: time,
                got: len,
                message: "样本长度超过了序列的时间维".to_string(),
            });
        }
        Ok(Self {
            data,
            seq_lens,
            sparse_dim: None,
        })
    }

    /// 稀疏的类别序列：`labels[b]`为第b个样本的标签序列，较短的样本以0补齐
    pub fn from_labels(labels: &[Vec<usize>], dim: usize) -> Result<Self, RecError> {
        let batch = labels.len();
        let time = labels.iter().map(Vec::len).max().unwrap_or(0);
        let mut data = vec![0.0; time * batch];
        for (b, seq) in labels.iter().enumerate() {
            for (t, &label) in seq.iter().enumerate() {
                data[t * batch + b] = label as f32;
            }
        }
        let tensor = Tensor::try_new(data, &[time, batch])?;
        let mut seq = Self::new(tensor, labels.iter().map(Vec::len).collect())?;
        seq.sparse_dim = Some(dim);
        Ok(seq)
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn seq_lens(&self) -> &[usize] {
        &self.seq_lens
    }

    pub fn max_len(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn batch(&self) -> usize {
        self.data.shape()[1]
    }

    /// 每个样本在各自的有效长度内做时间反转
    pub fn reversed(&self) -> Result<Self, RecError> {
        Ok(Self {
            data: self.data.reverse_within_lengths(&self.seq_lens)?,
            seq_lens: self.seq_lens.clone(),
            sparse_dim: self.sparse_dim,
        })
    }

    /// 第`t`帧`[batch, ...]`；超出时间维时返回全0帧（补齐）
    pub fn frame(&self, t: usize) -> Result<Tensor, RecError> {
        if t < self.max_len() {
            Ok(self.data.frame(t)?)
        } else {
            Ok(Tensor::zeros(&self.data.shape()[1..]))
        }
    }

    /// 单帧的描述符
    pub fn frame_template(&self, name: &str) -> DataTemplate {
        match self.sparse_dim {
            Some(dim) => DataTemplate::sparse(name, dim),
            None => DataTemplate::with_shape(name, &self.data.shape()[2..]),
        }
    }
}

/// 网络级的外部数据登记表。约定`"source"`为循环层的逐步输入，其余键（如`"classes"`）为目标
#[derive(Debug, Clone, Default)]
pub struct ExternData {
    data: BTreeMap<String, SeqData>,
}

impl ExternData {
    pub const SOURCE: &'static str = "source";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, seq: SeqData) -> Self {
        self.insert(key, seq);
        self
    }

    pub fn insert(&mut self, key: &str, seq: SeqData) {
        self.data.insert(key.to_string(), seq);
    }

    pub fn get(&self, key: &str) -> Option<&SeqData> {
        self.data.get(key)
    }

    pub fn source(&self) -> Option<&SeqData> {
        self.get(Self::SOURCE)
    }

    /// 取数据，不存在时报`MissingInput`
    pub fn require(&self, layer: &str, key: &str) -> Result<&SeqData, RecError> {
        self.get(key).ok_or_else(|| RecError::MissingInput {
            layer: layer.to_string(),
            key: key.to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }
}
