/*
 * @Author       : 老董
 * @Date         : 2026-02-04
 * @Description  : 参数仓库：按名字（如`dec/W`）存放各层的可训练参数。
 *                 参数只在构建循环层时创建一次，之后每个时间步都只读地共享
 */

use std::collections::BTreeMap;

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::errors::RecError;
use crate::tensor::Tensor;

/// 参数初始化方式
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    /// Xavier/Glorot均匀分布：`U(-a, a)`，`a = sqrt(6 / (fan_in + fan_out))`
    Xavier,
}

impl Init {
    pub fn generate_with_rng(&self, shape: &[usize], rng: &mut StdRng) -> Tensor {
        match self {
            Self::Zeros => Tensor::zeros(shape),
            Self::Xavier => {
                let fan_in = shape.first().copied().unwrap_or(1);
                let fan_out = shape.get(1).copied().unwrap_or(1);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                Tensor::new_uniform(-limit, limit, shape, rng)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamStore {
    params: BTreeMap<String, Tensor>,
    rng: StdRng,
}

impl Default for ParamStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamStore {
    pub fn new() -> Self {
        Self {
            params: BTreeMap::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// 使用固定种子，保证参数初始化可复现
    pub fn new_with_seed(seed: u64) -> Self {
        Self {
            params: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 创建参数；同名参数已存在时直接复用（形状须一致）
    pub fn create(&mut self, name: &str, shape: &[usize], init: Init) -> Result<&Tensor, RecError> {
        if let Some(existing) = self.params.get(name) {
            if existing.shape() != shape {
                return Err(RecError::ShapeMismatch {
                    layer: name.to_string(),
                    expected: shape.to_vec(),
                    got: existing.shape().to_vec(),
                });
            }
        } else {
            let value = init.generate_with_rng(shape, &mut self.rng);
            self.params.insert(name.to_string(), value);
        }
        self.get(name)
    }

    /// 以给定的值创建参数（如遗忘门偏置置1）；同名参数已存在时保留原值
    pub fn create_with_value(&mut self, name: &str, value: Tensor) -> Result<&Tensor, RecError> {
        if let Some(existing) = self.params.get(name) {
            if !existing.is_same_shape(&value) {
                return Err(RecError::ShapeMismatch {
                    layer: name.to_string(),
                    expected: value.shape().to_vec(),
                    got: existing.shape().to_vec(),
                });
            }
        } else {
            self.params.insert(name.to_string(), value);
        }
        self.get(name)
    }

    pub fn get(&self, name: &str) -> Result<&Tensor, RecError> {
        self.params
            .get(name)
            .ok_or_else(|| RecError::UnknownParam(name.to_string()))
    }

    /// 覆盖已有参数的值（形状须一致）
    pub fn set(&mut self, name: &str, value: Tensor) -> Result<(), RecError> {
        let existing = self
            .params
            .get_mut(name)
            .ok_or_else(|| RecError::UnknownParam(name.to_string()))?;
        if !existing.is_same_shape(&value) {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: existing.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        *existing = value;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
