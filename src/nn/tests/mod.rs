/*
 * @Author       : 老董
 * @Date         : 2026-02-14
 * @Description  : 循环层的单元测试，以及各测试共用的构造函数
 */

mod rec_driver;
mod rec_loss_config;
mod rec_template;

use approx::assert_abs_diff_eq;

use crate::errors::RecError;
use crate::nn::{ExternData, RecLayerConfig, SeqData};
use crate::tensor::Tensor;

/// 确定性的`[time, batch, dim]`输入
fn seq_input(time: usize, batch: usize, dim: usize) -> Tensor {
    let data = (0..time * batch * dim)
        .map(|i| ((i as f32) * 0.37 + 0.1).sin())
        .collect::<Vec<_>>();
    Tensor::new(&data, &[time, batch, dim])
}

/// 只含逐步输入`data:source`的外部数据
fn source_data(
    time: usize,
    batch: usize,
    dim: usize,
    seq_lens: Vec<usize>,
) -> Result<ExternData, RecError> {
    let source = SeqData::new(seq_input(time, batch, dim), seq_lens)?;
    Ok(ExternData::new().with(ExternData::SOURCE, source))
}

/// 由JSON形式的子网络构造配置，`extra`中的键（如`max_seq_len`）并入顶层
fn subnetwork_config(
    unit: serde_json::Value,
    extra: serde_json::Value,
) -> Result<RecLayerConfig, RecError> {
    let mut config = serde_json::json!({ "unit": unit });
    if let (Some(config), Some(extra)) = (config.as_object_mut(), extra.as_object()) {
        config.extend(extra.clone());
    }
    RecLayerConfig::from_json(config)
}

fn assert_tensor_near(a: &Tensor, b: &Tensor, epsilon: f32) {
    assert_eq!(a.shape(), b.shape());
    for (x, y) in a.data_as_vec().iter().zip(b.data_as_vec()) {
        assert_abs_diff_eq!(*x, y, epsilon = epsilon);
    }
}
