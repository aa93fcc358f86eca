/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 张量：基于ndarray的动态维度f32数组。
 *                 循环层只需要其中与“按行（batch*beam）”操作相关的子集：
 *                 逐元素运算、矩阵乘、按行gather/tile、沿时间轴堆叠/切片、top-k等
 */

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand::distributions::{Distribution, Uniform};

use crate::errors::TensorError;

mod index;
mod ops;
mod property;
mod shape;


/// 定义张量的结构体。其可以是标量、向量、矩阵或更高维度的数组。
/// 循环层内部约定：第0维总是“行”，即`batch`或`batch*beam`（时间主序的序列则第0维为时间）。
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: ArrayD<f32>,
}

impl Tensor {
    /// 创建一个张量。`data`的长度必须和`shape`中所有元素的乘积相等，否则panic。
    /// 库内部请使用不会panic的[`Tensor::try_new`]。
    pub fn new(data: &[f32], shape: &[usize]) -> Tensor {
        match Self::try_new(data.to_vec(), shape) {
            Ok(tensor) => tensor,
            Err(e) => panic!("{}", e),
        }
    }

    pub fn try_new(data: Vec<f32>, shape: &[usize]) -> Result<Tensor, TensorError> {
        let data_len = data.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), data).map_err(|_| {
            TensorError::DataShapeMismatch {
                data_len,
                shape: shape.to_vec(),
            }
        })?;
        Ok(Tensor { data })
    }

    pub fn zeros(shape: &[usize]) -> Tensor {
        Tensor {
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn ones(shape: &[usize]) -> Tensor {
        Self::full(1.0, shape)
    }

    pub fn full(value: f32, shape: &[usize]) -> Tensor {
        Tensor {
            data: ArrayD::from_elem(IxDyn(shape), value),
        }
    }

    /// 创建一个随机张量，其值在[min, max]的闭区间
    pub fn new_uniform<R: Rng>(min: f32, max: f32, shape: &[usize], rng: &mut R) -> Tensor {
        let uniform = Uniform::from(min..=max);
        let data = (0..shape.iter().product::<usize>())
            .map(|_| uniform.sample(rng))
            .collect::<Vec<_>>();
        Tensor {
            data: ArrayD::from_shape_vec(IxDyn(shape), data)
                .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape))),
        }
    }

    /// 由类别索引构造形状为`[n]`的稀疏标签张量
    pub fn from_labels(labels: &[usize]) -> Tensor {
        Tensor {
            data: ArrayD::from_shape_vec(
                IxDyn(&[labels.len()]),
                labels.iter().map(|&l| l as f32).collect(),
            )
            .unwrap_or_else(|_| ArrayD::zeros(IxDyn(&[labels.len()]))),
        }
    }
}
