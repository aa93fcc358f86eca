use serde_json::json;

use super::{assert_tensor_near, seq_input, source_data, subnetwork_config};
use crate::assert_err;
use crate::errors::RecError;
use crate::nn::{BaseLayer, ExternData, NetworkFlags, ParamStore, ParentNetwork, RecLayer, SeqData};
use crate::tensor::Tensor;

/// `state = tanh([x, prev:state] W + b)`，`output = state`
fn recurrent_unit() -> serde_json::Value {
    json!({
        "state": {
            "class": "linear", "from": ["data:source", "prev:state"], "n_out": 3,
            "activation": "tanh"
        },
        "output": { "class": "copy", "from": ["state"] },
    })
}

/// 输出步号、由`end`决定何时结束的单元
fn counting_unit(end: serde_json::Value) -> serde_json::Value {
    json!({
        "output": { "class": "copy", "from": [":i"] },
        "end": end,
    })
}

// ==================== 长度已知 ====================

/// 测试带`prev:`自引用的子网络与手写递推一致
#[test]
fn test_prev_self_reference_matches_manual_recurrence() -> Result<(), RecError> {
    let data = source_data(5, 2, 2, vec![5, 5])?;
    let config = subnetwork_config(recurrent_unit(), json!({}))?;
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(42);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;

    assert_eq!(result.output.shape(), &[5, 2, 3]);
    assert_eq!(result.seq_lens, vec![5, 5]);
    assert_eq!(result.steps, 5);
    assert!(result.beam_scores.is_none());
    assert!(result.losses.is_none());

    // 手写递推，初始状态为0
    let (w, b) = (params.get("state/W")?, params.get("state/b")?);
    let x = seq_input(5, 2, 2);
    let mut h = Tensor::zeros(&[2, 3]);
    for t in 0..5 {
        let x_t = x.frame(t)?;
        h = Tensor::concat_last(&[&x_t, &h])?.mat_mul(w)?.add(b)?.tanh();
        assert_tensor_near(&result.output.frame(t)?, &h, 1e-6);
    }
    Ok(())
}

/// 测试已知长度时按最长样本执行
#[test]
fn test_known_lengths_drive_step_count() -> Result<(), RecError> {
    let data = source_data(5, 2, 2, vec![3, 5])?;
    let config = subnetwork_config(recurrent_unit(), json!({}))?;
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(1);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;
    assert_eq!(result.steps, 5);
    assert_eq!(result.seq_lens, vec![3, 5]);
    assert_eq!(result.output.shape(), &[5, 2, 3]);
    Ok(())
}

/// 测试长度为0的输入
#[test]
fn test_empty_sequences() -> Result<(), RecError> {
    let data = ExternData::new().with(
        ExternData::SOURCE,
        SeqData::new(Tensor::zeros(&[0, 2, 2]), vec![0, 0])?,
    );
    let config = subnetwork_config(recurrent_unit(), json!({}))?;
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(1);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;
    assert_eq!(result.steps, 0);
    assert_eq!(result.output.shape(), &[0, 2, 3]);
    Ok(())
}

/// 测试反向运行等价于“反转输入、正向运行、再反转输出”
#[test]
fn test_reverse_direction() -> Result<(), RecError> {
    let seq = SeqData::new(seq_input(4, 2, 2), vec![4, 2])?;
    let data = ExternData::new().with(ExternData::SOURCE, seq.clone());
    let reversed = ExternData::new().with(ExternData::SOURCE, seq.reversed()?);
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(3);
    let forward = RecLayer::new(
        "rec",
        subnetwork_config(recurrent_unit(), json!({}))?,
        &parent,
        &data,
        NetworkFlags::default(),
        &mut params,
    )?;
    let backward = RecLayer::new(
        "rec",
        subnetwork_config(recurrent_unit(), json!({ "direction": -1 }))?,
        &parent,
        &data,
        NetworkFlags::default(),
        &mut params,
    )?;

    let expected = forward.run(&params, &parent, &reversed)?.output;
    let actual = backward.run(&params, &parent, &data)?;
    assert_tensor_near(&actual.output.reverse_within_lengths(&actual.seq_lens)?, &expected, 1e-6);
    Ok(())
}

// ==================== 长度由`end`动态决定 ====================

/// 测试长度等于`end`第一次触发时的步号，触发的那一步仍会执行
#[test]
fn test_dynamic_length_from_end() -> Result<(), RecError> {
    let parent = ParentNetwork::with_batch_dim(1);
    let data = ExternData::new();
    let unit =
        counting_unit(json!({ "class": "compare", "from": [":i"], "kind": "equal", "value": 3 }));
    let config = subnetwork_config(unit, json!({ "max_seq_len": 10 }))?;
    let mut params = ParamStore::new_with_seed(0);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;

    assert_eq!(result.seq_lens, vec![3]);
    assert_eq!(result.steps, 4);
    assert_eq!(result.output.shape(), &[3, 1]);
    assert_eq!(result.output.data_as_vec(), vec![0., 1., 2.]);
    Ok(())
}

/// 测试`end`始终不触发时在`max_seq_len`处停止
#[test]
fn test_end_never_fires() -> Result<(), RecError> {
    let parent = ParentNetwork::with_batch_dim(2);
    let data = ExternData::new();
    let unit =
        counting_unit(json!({ "class": "compare", "from": [":i"], "kind": "equal", "value": 100 }));
    let config = subnetwork_config(unit, json!({ "max_seq_len": 4 }))?;
    let mut params = ParamStore::new_with_seed(0);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;
    assert_eq!(result.seq_lens, vec![4, 4]);
    assert_eq!(result.steps, 4);
    assert_eq!(result.output.shape(), &[4, 2]);
    Ok(())
}

/// 测试各样本在不同步结束：输出按最长者截断，循环在所有样本都结束后停止
#[test]
fn test_per_example_end() -> Result<(), RecError> {
    let parent = ParentNetwork::new().with_layer(
        "limit",
        BaseLayer::new("limit", Tensor::new(&[1., 3.], &[2])),
    );
    let data = ExternData::new();
    let unit = counting_unit(
        json!({ "class": "compare", "from": [":i", "base:limit"], "kind": "greater_equal" }),
    );
    let config = subnetwork_config(unit, json!({ "max_seq_len": 10 }))?;
    let mut params = ParamStore::new_with_seed(0);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;

    assert_eq!(result.seq_lens, vec![1, 3]);
    assert_eq!(result.steps, 4);
    assert_eq!(result.output.shape(), &[3, 2]);
    assert_eq!(result.output.data_as_vec(), vec![0., 0., 1., 1., 2., 2.]);
    Ok(())
}

// ==================== 运行期错误 ====================

/// 测试目标与输入的逐样本长度不一致
#[test]
fn test_target_length_mismatch() -> Result<(), RecError> {
    let data = source_data(5, 2, 2, vec![3, 5])?.with(
        "classes",
        SeqData::from_labels(&[vec![1, 2, 3], vec![0, 1, 2, 3]], 4)?,
    );
    let unit = json!({
        "prob": { "class": "linear", "from": ["data:source"], "n_out": 4, "activation": "softmax" },
        "output": { "class": "choice", "from": ["prob"], "beam_size": 2 },
    });
    let config = subnetwork_config(unit, json!({}))?;
    let mut params = ParamStore::new_with_seed(0);
    let parent = ParentNetwork::new();
    assert_err!(
        RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params),
        RecError::LengthMismatch { expected: 5, got: 4, .. }
    );
    Ok(())
}

/// 测试某一步算出的值与声明的形状不符
#[test]
fn test_step_shape_mismatch() -> Result<(), RecError> {
    let unit = json!({ "output": { "class": "copy", "from": ["data:source"] } });
    let config = subnetwork_config(unit, json!({}))?;
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(0);
    let layer = RecLayer::new(
        "rec",
        config,
        &parent,
        &source_data(2, 2, 3, vec![2, 2])?,
        NetworkFlags::default(),
        &mut params,
    )?;
    assert_err!(
        layer.run(&params, &parent, &source_data(2, 2, 4, vec![2, 2])?),
        RecError::ShapeMismatch("output", [2, 3], [2, 4])
    );
    Ok(())
}

/// 测试`prev:`引用的初始值取自父网络层
#[test]
fn test_initial_output_from_base() -> Result<(), RecError> {
    let h0 = Tensor::new(&[1., 2., 3., -1., 0.5, 0.], &[2, 3]);
    let parent = ParentNetwork::new().with_layer("h0", BaseLayer::new("h0", h0.clone()));
    let data = source_data(3, 2, 2, vec![3, 3])?;
    let unit = json!({
        "state": {
            "class": "linear",
            "from": ["data:source", "prev:state"],
            "n_out": 3,
            "activation": "tanh",
            "initial_output": "base:h0"
        },
        "output": { "class": "copy", "from": ["state"] },
    });
    let config = subnetwork_config(unit, json!({}))?;
    let mut params = ParamStore::new_with_seed(5);
    let layer = RecLayer::new("rec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    let result = layer.run(&params, &parent, &data)?;

    let (w, b) = (params.get("state/W")?, params.get("state/b")?);
    let x = seq_input(3, 2, 2);
    let mut h = h0;
    for t in 0..3 {
        h = Tensor::concat_last(&[&x.frame(t)?, &h])?.mat_mul(w)?.add(b)?.tanh();
        assert_tensor_near(&result.output.frame(t)?, &h, 1e-6);
    }
    Ok(())
}
