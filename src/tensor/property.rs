/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 本类仅包含一些属性方法，不包含任何运算方法，所以不会需要用到mut
 */

use super::Tensor;
use ndarray::IxDyn;

impl Tensor {
    /// 若为向量，`shape`可以是[n]、[1,n]、[n,1]；
    /// 若为矩阵，`shape`可以是[n,m]；
    /// 若为更高维度的数组，`shape`可以是[c,n,m,...]。
    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    /// 张量的维（dim）数、阶（rank）数
    pub fn dimension(&self) -> usize {
        self.data.ndim()
    }

    /// 计算张量中所有元素的数量
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 第0维的长度（循环层中即“行数”）
    pub fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    pub fn is_same_shape(&self, other: &Self) -> bool {
        self.shape() == other.shape()
    }

    /// 按逻辑顺序拷贝出全部元素
    pub fn data_as_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// 取指定下标处的元素
    pub fn value(&self, indices: &[usize]) -> Option<f32> {
        self.data.get(IxDyn(indices)).copied()
    }

    /// 将`[n]`或`[n, 1]`形状的张量解读为类别索引（负数截断为0）
    pub fn to_labels(&self) -> Vec<usize> {
        self.data
            .iter()
            .map(|&v| if v > 0.0 { v.round() as usize } else { 0 })
            .collect()
    }

    /// 将张量解读为布尔标志（非零为真）
    pub fn to_flags(&self) -> Vec<bool> {
        self.data.iter().map(|&v| v != 0.0).collect()
    }
}
