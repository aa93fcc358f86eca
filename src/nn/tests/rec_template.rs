use serde_json::json;

use super::{source_data, subnetwork_config};
use crate::assert_err;
use crate::errors::RecError;
use crate::nn::{
    BaseLayer, DType, ExternData, NetworkFlags, ParamStore, ParentNetwork, RecLayer, RecUnit,
};
use crate::tensor::Tensor;

fn build(
    unit: serde_json::Value,
    extra: serde_json::Value,
    parent: &ParentNetwork,
    data: &ExternData,
) -> Result<RecLayer, RecError> {
    let config = subnetwork_config(unit, extra)?;
    let mut params = ParamStore::new_with_seed(7);
    RecLayer::new("dec", config, parent, data, NetworkFlags::default(), &mut params)
}

// ==================== 名字解析 ====================

/// 测试没有`output`层的子网络
#[test]
fn test_missing_output_layer() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({ "state": { "class": "linear", "from": [":i"], "n_out": 2 } });
    assert_err!(
        build(unit, json!({ "max_seq_len": 3 }), &parent, &ExternData::new()),
        RecError::MissingOutputLayer
    );
}

/// 测试引用不存在的同一步层、上一步层与父网络层
#[test]
fn test_unknown_references() {
    let parent = ParentNetwork::with_batch_dim(1);
    let data = ExternData::new();
    let extra = json!({ "max_seq_len": 3 });

    let unit = json!({ "output": { "class": "linear", "from": ["nope"], "n_out": 2 } });
    assert_err!(
        build(unit, extra.clone(), &parent, &data),
        RecError::UnknownLayer("output", "nope")
    );

    let unit = json!({ "output": { "class": "linear", "from": ["prev:nope"], "n_out": 2 } });
    assert_err!(
        build(unit, extra.clone(), &parent, &data),
        RecError::UnknownLayer("output", "prev:nope")
    );

    let unit = json!({ "output": { "class": "linear", "from": ["base:enc"], "n_out": 2 } });
    assert_err!(build(unit, extra, &parent, &data), RecError::UnknownLayer("output", "base:enc"));
}

/// 测试同一时间步内的循环依赖（经`prev:`的自引用不算）
#[test]
fn test_cyclic_dependency() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({
        "output": { "class": "linear", "from": ["a"], "n_out": 2 },
        "a": { "class": "linear", "from": ["b"], "n_out": 2 },
        "b": { "class": "linear", "from": ["a"], "n_out": 2 },
    });
    assert_err!(
        build(unit, json!({ "max_seq_len": 3 }), &parent, &ExternData::new()),
        RecError::CyclicDependency(cycle) if *cycle == vec!["a", "b", "a"]
    );
}

/// 测试目标数据缺失
#[test]
fn test_missing_target() -> Result<(), RecError> {
    let data = source_data(3, 2, 2, vec![3, 3])?;
    let unit = json!({
        "prob": { "class": "linear", "from": ["data:source"], "n_out": 4, "activation": "softmax" },
        "output": { "class": "choice", "from": ["prob"], "beam_size": 2 },
    });
    assert_err!(
        build(unit, json!({}), &ParentNetwork::new(), &data),
        RecError::MissingInput { layer, key } if layer == "output" && key == "classes"
    );
    Ok(())
}

// ==================== 长度相关的构建期检查 ====================

/// 测试长度事先未知却没有`end`层
#[test]
fn test_missing_end_layer() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({ "output": { "class": "copy", "from": [":i"] } });
    assert_err!(
        build(unit, json!({ "max_seq_len": 5 }), &parent, &ExternData::new()),
        RecError::MissingEndLayer
    );
}

/// 测试长度事先未知却没有`max_seq_len`
#[test]
fn test_missing_max_seq_len() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({
        "output": { "class": "copy", "from": [":i"] },
        "end": { "class": "compare", "from": [":i"], "kind": "equal", "value": 2 },
    });
    assert_err!(
        build(unit, json!({}), &parent, &ExternData::new()),
        RecError::Config(msg) if msg.contains("max_seq_len")
    );
}

/// 测试长度事先未知时不能反向运行
#[test]
fn test_reverse_needs_known_length() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({
        "output": { "class": "copy", "from": [":i"] },
        "end": { "class": "compare", "from": [":i"], "kind": "equal", "value": 2 },
    });
    assert_err!(
        build(unit, json!({ "max_seq_len": 4, "direction": -1 }), &parent, &ExternData::new()),
        RecError::Config(msg) if msg.contains("反向")
    );
}

/// 测试`end`层须为布尔标志
#[test]
fn test_end_layer_must_be_flag() {
    let parent = ParentNetwork::with_batch_dim(1);
    let unit = json!({
        "output": { "class": "copy", "from": [":i"] },
        "end": { "class": "constant", "value": 0 },
    });
    assert_err!(
        build(unit, json!({ "max_seq_len": 4 }), &parent, &ExternData::new()),
        RecError::Config(msg) if msg.contains("end")
    );
}

/// 测试direction只能为1或-1
#[test]
fn test_invalid_direction() -> Result<(), RecError> {
    let data = source_data(2, 1, 2, vec![2])?;
    let unit = json!({ "output": { "class": "copy", "from": ["data:source"] } });
    assert_err!(
        build(unit, json!({ "direction": 2 }), &ParentNetwork::new(), &data),
        RecError::Config(msg) if msg.contains("direction")
    );
    Ok(())
}

// ==================== 形状推导 ====================

/// 测试带`prev:`自引用的子网络的形状推导与`prev_layers_needed`
#[test]
fn test_template_inference() -> Result<(), RecError> {
    let data = source_data(4, 2, 2, vec![4, 3])?;
    let unit = json!({
        "state": {
            "class": "linear", "from": ["data:source", "prev:state"], "n_out": 3,
            "activation": "tanh"
        },
        "output": { "class": "copy", "from": ["state"] },
        "unused": { "class": "linear", "from": ["data:source"], "n_out": 9 },
    });
    let layer = build(unit, json!({ "n_out": 3 }), &ParentNetwork::new(), &data)?;
    assert!(matches!(layer.unit(), RecUnit::SubnetworkCell(_)));
    assert_eq!(layer.batch(), 2);
    assert_eq!(layer.output().name, "dec");
    assert_eq!(layer.output().shape, vec![3]);

    let graph = layer.subnetwork().ok_or(RecError::MissingOutputLayer)?.graph();
    // 未被引用的层不会被构建
    assert!(graph.layer("unused").is_none());
    assert_eq!(graph.order(), &["state".to_string(), "output".to_string()]);
    assert_eq!(graph.prev_layers_needed().iter().collect::<Vec<_>>(), vec!["state"]);
    assert_eq!(graph.extern_keys().iter().collect::<Vec<_>>(), vec!["source"]);
    Ok(())
}

/// 测试`n_out`与`output`层不符
#[test]
fn test_n_out_mismatch() -> Result<(), RecError> {
    let data = source_data(2, 1, 3, vec![2])?;
    let unit = json!({ "output": { "class": "copy", "from": ["data:source"] } });
    assert_err!(
        build(unit, json!({ "n_out": 4 }), &ParentNetwork::new(), &data),
        RecError::ShapeMismatch("dec", [4], [3])
    );
    Ok(())
}

/// 测试步号、比较层、父网络层的描述
#[test]
fn test_step_index_and_compare_templates() -> Result<(), RecError> {
    let parent = ParentNetwork::new().with_layer(
        "limit",
        BaseLayer::new("limit", Tensor::new(&[1., 3.], &[2])),
    );
    let unit = json!({
        "output": { "class": "copy", "from": [":i"] },
        "end": { "class": "compare", "from": [":i", "base:limit"], "kind": "greater_equal" },
    });
    let layer = build(unit, json!({ "max_seq_len": 6 }), &parent, &ExternData::new())?;
    assert_eq!(layer.batch(), 2);
    let graph = layer.subnetwork().ok_or(RecError::MissingOutputLayer)?.graph();
    let output = &graph.output().output;
    assert_eq!(output.dtype, DType::Int32);
    assert!(output.shape.is_empty());
    let end = &graph.layer("end").ok_or(RecError::MissingEndLayer)?.output;
    assert_eq!(end.dtype, DType::Bool);
    assert!(graph.has_end());
    Ok(())
}
