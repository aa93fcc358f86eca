/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 激活函数（逐元素或沿最后一维）
 */

use ndarray::Axis;

use crate::tensor::Tensor;

impl Tensor {
    pub fn tanh(&self) -> Tensor {
        self.map(f32::tanh)
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|x| 1.0 / (1.0 + (-x).exp()))
    }

    pub fn relu(&self) -> Tensor {
        self.map(|x| x.max(0.0))
    }

    pub fn ln(&self) -> Tensor {
        self.map(f32::ln)
    }

    /// 沿最后一维做softmax。整条均为`-inf`（被完全屏蔽）时输出全0
    pub fn softmax_last(&self) -> Tensor {
        let mut data = self.data.clone();
        if data.ndim() == 0 {
            return Tensor::ones(&[]);
        }
        let axis = Axis(data.ndim() - 1);
        for mut lane in data.lanes_mut(axis) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            if !max.is_finite() {
                lane.fill(0.0);
                continue;
            }
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.sum();
            lane.mapv_inplace(|v| v / sum);
        }
        Tensor { data }
    }

    /// 沿最后一维做log-softmax（数值稳定写法）
    pub fn log_softmax_last(&self) -> Tensor {
        let mut data = self.data.clone();
        if data.ndim() == 0 {
            return Tensor::zeros(&[]);
        }
        let axis = Axis(data.ndim() - 1);
        for mut lane in data.lanes_mut(axis) {
            let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
            if !max.is_finite() {
                continue;
            }
            let log_sum = lane.fold(0.0, |s, &v| s + (v - max).exp()).ln();
            lane.mapv_inplace(|v| v - max - log_sum);
        }
        Tensor { data }
    }
}
