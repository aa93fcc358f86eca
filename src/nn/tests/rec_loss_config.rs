use approx::assert_abs_diff_eq;
use serde_json::json;

use super::{assert_tensor_near, seq_input, source_data, subnetwork_config};
use crate::assert_err;
use crate::errors::RecError;
use crate::nn::rec::kinds::{Activation, LayerKind, Linear};
use crate::nn::rec::{InitialValue, LossKind, UnitDesc};
use crate::nn::{
    BaseLayer, ExternData, NetworkFlags, ParamStore, ParentNetwork, RecLayer, RecLayerConfig,
    SeqData,
};
use crate::tensor::Tensor;

// ==================== 配置 ====================

/// 测试从JSON反序列化配置（含缺省值与单字符串的`from`）
#[test]
fn test_config_from_json() -> Result<(), RecError> {
    let config = RecLayerConfig::from_json(json!({
        "unit": {
            "output": {
                "class": "linear",
                "from": "data:source",
                "n_out": 2,
                "activation": "tanh",
                "loss": "mse",
                "initial_output": "base:x"
            }
        },
        "max_seq_len": 7
    }))?;
    assert_eq!(config.max_seq_len, Some(7));
    assert_eq!(config.direction, 1);
    assert_eq!(config.target, "classes");
    assert!(config.optimize_move_layers_out);
    assert_eq!(config.num_layers, 1);

    let UnitDesc::Subnetwork(layers) = &config.unit else {
        panic!("应解析为子网络单元");
    };
    let output = &layers["output"];
    assert_eq!(output.from, vec!["data:source"]);
    assert_eq!(output.loss, Some(LossKind::Mse));
    assert_eq!(output.loss_scale, 1.0);
    assert_eq!(output.initial_output, Some(InitialValue::Named("base:x".to_string())));
    assert!(matches!(
        output.kind,
        LayerKind::Linear(Linear { n_out: 2, activation: Activation::Tanh, with_bias: true })
    ));

    let cell =
        RecLayerConfig::from_json(json!({ "unit": "lstm", "n_out": 4, "initial_state": 0.5 }))?;
    assert!(matches!(&cell.unit, UnitDesc::Cell(name) if name == "lstm"));
    assert_eq!(cell.initial_state, Some(InitialValue::Constant(0.5)));

    assert_err!(
        RecLayerConfig::from_json(json!({ "unit": { "output": { "class": "nope" } } })),
        RecError::Config(_)
    );
    Ok(())
}

/// 测试无法识别的初始值
#[test]
fn test_bad_initial_value() -> Result<(), RecError> {
    let data = source_data(2, 1, 2, vec![2])?;
    let unit = json!({
        "state": {
            "class": "linear",
            "from": ["data:source", "prev:state"],
            "n_out": 2,
            "initial_output": "twos"
        },
        "output": { "class": "copy", "from": ["state"] },
    });
    let mut params = ParamStore::new_with_seed(0);
    assert_err!(
        RecLayer::new(
            "rec",
            subnetwork_config(unit, json!({}))?,
            &ParentNetwork::new(),
            &data,
            NetworkFlags::default(),
            &mut params
        ),
        RecError::Config(msg) if msg.contains("twos")
    );
    Ok(())
}

// ==================== 损失 ====================

/// 测试按长度屏蔽的交叉熵、均方误差与错误率
#[test]
fn test_losses_masked_by_length() -> Result<(), RecError> {
    let labels = [vec![0, 1, 2], vec![2, 1]];
    let feat = SeqData::new(seq_input(3, 2, 2).scale(2.0), vec![3, 2])?;
    let data = source_data(3, 2, 2, vec![3, 2])?
        .with("classes", SeqData::from_labels(&labels, 3)?)
        .with("feat", feat.clone());
    let unit = json!({
        "output": {
            "class": "linear",
            "from": ["data:source"],
            "n_out": 3,
            "activation": "softmax",
            "loss": "ce",
            "loss_scale": 0.5
        },
        "aux": {
            "class": "linear", "from": ["data:source"], "n_out": 2, "loss": "mse", "target": "feat"
        },
    });
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(21);
    let layer = RecLayer::new(
        "rec",
        subnetwork_config(unit, json!({}))?,
        &parent,
        &data,
        NetworkFlags::eval(),
        &mut params,
    )?;
    let result = layer.run(&params, &parent, &data)?;
    let losses = result.losses.ok_or(RecError::MissingEndLayer)?;

    // 交叉熵与错误率
    let (mut ce, mut errors) = (0.0_f32, 0.0_f32);
    for (b, seq) in labels.iter().enumerate() {
        for (t, &label) in seq.iter().enumerate() {
            let probs = (0..3)
                .map(|d| result.output.value(&[t, b, d]).unwrap_or_default())
                .collect::<Vec<_>>();
            ce -= probs[label].max(1e-12).ln();
            let predicted = (0..3).fold(0, |best, d| if probs[d] > probs[best] { d } else { best });
            if predicted != label {
                errors += 1.0;
            }
        }
    }
    let output = &losses.per_layer["output"];
    assert_abs_diff_eq!(output.loss, 0.5 * ce, epsilon = 1e-4);
    assert_eq!(output.error, Some(errors));

    // 均方误差：aux = x W + b
    let (w, bias) = (params.get("aux/W")?, params.get("aux/b")?);
    let x = seq_input(3, 2, 2);
    let mut mse = 0.0_f32;
    for (t, len_mask) in [[true, true], [true, true], [true, false]].iter().enumerate() {
        let diff = x.frame(t)?.mat_mul(w)?.add(bias)?.sub(&feat.frame(t)?)?;
        for (b, &active) in len_mask.iter().enumerate() {
            if active {
                mse += (0..2)
                    .map(|d| diff.value(&[b, d]).unwrap_or_default().powi(2))
                    .sum::<f32>();
            }
        }
    }
    let aux = &losses.per_layer["aux"];
    assert_abs_diff_eq!(aux.loss, mse, epsilon = 1e-4);
    assert_eq!(aux.error, None);

    assert_abs_diff_eq!(losses.total_loss, 0.5 * ce + mse, epsilon = 1e-4);
    // 错误率取自按名字排序的最后一个损失层
    assert_eq!(losses.error, Some(errors));
    assert_abs_diff_eq!(losses.norm_factor, 0.2);
    Ok(())
}

/// 测试不评估时不计算损失
#[test]
fn test_no_losses_without_eval() -> Result<(), RecError> {
    let data = source_data(2, 1, 2, vec![2])?;
    let unit = json!({
        "output": {
            "class": "linear", "from": ["data:source"], "n_out": 2, "loss": "mse", "target": "feat"
        },
    });
    let parent = ParentNetwork::new();
    let mut params = ParamStore::new_with_seed(0);
    // 不评估时连目标数据都不需要
    let layer = RecLayer::new(
        "rec",
        subnetwork_config(unit, json!({}))?,
        &parent,
        &data,
        NetworkFlags::default(),
        &mut params,
    )?;
    assert!(layer.run(&params, &parent, &data)?.losses.is_none());
    Ok(())
}

// ==================== 注意力 ====================

/// 编码序列：前两个位置相同，第三个位置超出有效长度
fn encoder_parent() -> ParentNetwork {
    let enc = Tensor::new(&[1., 2., 1., 2., 100., -100.], &[1, 3, 2]);
    ParentNetwork::new().with_layer("enc", BaseLayer::with_seq_lens("enc", enc, vec![2]))
}

/// 测试点积注意力与拼接注意力都屏蔽超出长度的位置
#[test]
fn test_attention_masks_padding() -> Result<(), RecError> {
    let parent = encoder_parent();
    let data = ExternData::new().with(
        ExternData::SOURCE,
        SeqData::new(Tensor::ones(&[2, 1, 2]), vec![2])?,
    );
    let expected = Tensor::new(&[1., 2., 1., 2.], &[2, 1, 2]);
    for att in [
        json!({ "class": "dot_attention", "from": ["data:source"], "base": "base:enc" }),
        json!({
            "class": "concat_attention", "from": ["data:source"], "base": "base:enc", "n_att": 3
        }),
    ] {
        let unit = json!({ "att": att, "output": { "class": "copy", "from": ["att"] } });
        let mut params = ParamStore::new_with_seed(2);
        let layer = RecLayer::new(
            "dec",
            subnetwork_config(unit, json!({}))?,
            &parent,
            &data,
            NetworkFlags::default(),
            &mut params,
        )?;
        let result = layer.run(&params, &parent, &data)?;
        assert_tensor_near(&result.output, &expected, 1e-5);
    }
    Ok(())
}

/// 测试点积注意力的查询维度须与编码维度一致
#[test]
fn test_dot_attention_query_dim() -> Result<(), RecError> {
    let parent = encoder_parent();
    let data = source_data(2, 1, 3, vec![2])?;
    let unit = json!({
        "att": { "class": "dot_attention", "from": ["data:source"], "base": "base:enc" },
        "output": { "class": "copy", "from": ["att"] },
    });
    let mut params = ParamStore::new_with_seed(0);
    let config = subnetwork_config(unit, json!({}))?;
    assert_err!(
        RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params),
        RecError::ShapeMismatch("att", [2], [3])
    );
    Ok(())
}

/// 测试有效长度为0的样本得到全零的上下文，不影响同批的其他样本
#[test]
fn test_attention_zero_length_context() -> Result<(), RecError> {
    let enc = Tensor::new(&[1., 2., 1., 2., 100., -100., 5., 6., 7., 8., 9., 10.], &[2, 3, 2]);
    let parent =
        ParentNetwork::new().with_layer("enc", BaseLayer::with_seq_lens("enc", enc, vec![2, 0]));
    let data = ExternData::new().with(
        ExternData::SOURCE,
        SeqData::new(Tensor::ones(&[2, 2, 2]), vec![2, 2])?,
    );
    let expected = Tensor::new(&[1., 2., 0., 0., 1., 2., 0., 0.], &[2, 2, 2]);
    for att in [
        json!({ "class": "dot_attention", "from": ["data:source"], "base": "base:enc" }),
        json!({
            "class": "concat_attention", "from": ["data:source"], "base": "base:enc", "n_att": 3
        }),
    ] {
        let unit = json!({ "att": att, "output": { "class": "copy", "from": ["att"] } });
        let mut params = ParamStore::new_with_seed(2);
        let config = subnetwork_config(unit, json!({}))?;
        let layer =
            RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
        let result = layer.run(&params, &parent, &data)?;
        assert!(result.output.data_as_vec().iter().all(|v| v.is_finite()));
        assert_tensor_near(&result.output, &expected, 1e-5);
    }
    Ok(())
}

/// 编码序列`[1, 2, 3, 4]`，有效长度3；两步的位置分别为1.0与3.6
fn gauss_window_setup() -> Result<(ParentNetwork, ExternData), RecError> {
    let enc = Tensor::new(&[1., 2., 3., 4.], &[1, 4, 1]);
    let parent =
        ParentNetwork::new().with_layer("enc", BaseLayer::with_seq_lens("enc", enc, vec![3]));
    let location = SeqData::new(Tensor::new(&[1.0, 3.6], &[2, 1, 1]), vec![2])?;
    Ok((parent, ExternData::new().with(ExternData::SOURCE, location)))
}

/// 测试高斯窗注意力：窗口以round(t)为中心，越过有效长度的帧取最后一个有效帧
#[test]
fn test_gauss_window_attention() -> Result<(), RecError> {
    let (parent, data) = gauss_window_setup()?;
    let unit = json!({
        "att": {
            "class": "gauss_window_attention", "from": ["data:source"], "base": "base:enc",
            "window_size": 3
        },
        "output": { "class": "copy", "from": ["att"] },
    });
    let mut params = ParamStore::new_with_seed(0);
    let config = subnetwork_config(unit, json!({}))?;
    let layer = RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    assert!(params.is_empty());

    let result = layer.run(&params, &parent, &data)?;
    assert_eq!(result.output.shape(), &[2, 1, 1]);
    // 第0步：窗口为第0~2帧；第1步：窗口为第3~5帧，都截到第2帧（值为3）
    let norm = 1.0 / (2.0 * std::f32::consts::PI).sqrt();
    let g = |d: f32| (-d * d / 2.0).exp() * norm;
    let expected = [
        g(1.0) + 2.0 * g(0.0) + 3.0 * g(1.0),
        3.0 * (g(0.6) + g(0.4) + g(1.4)),
    ];
    for (actual, expected) in result.output.data_as_vec().iter().zip(expected) {
        assert_abs_diff_eq!(*actual, expected, epsilon = 1e-5);
    }
    assert_abs_diff_eq!(result.output.data_as_vec()[0], 1.765_767, epsilon = 1e-5);
    Ok(())
}

/// 测试`inner_size`：在t附近按步长再取若干位置，输出多出一维
#[test]
fn test_gauss_window_attention_inner_size() -> Result<(), RecError> {
    let (parent, data) = gauss_window_setup()?;
    let unit = json!({
        "att": {
            "class": "gauss_window_attention", "from": ["data:source"], "base": "base:enc",
            "window_size": 3, "inner_size": 2,
        },
        "output": { "class": "copy", "from": ["att"] },
    });
    let mut params = ParamStore::new_with_seed(0);
    let config = subnetwork_config(unit, json!({}))?;
    let layer = RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params)?;
    assert_eq!(layer.output().shape, vec![2, 1]);
    let result = layer.run(&params, &parent, &data)?;
    assert_eq!(result.output.shape(), &[2, 1, 2, 1]);
    // 第0步的两个位置为t-1与t-0.5
    let first = result.output.frame(0)?.data_as_vec();
    assert_abs_diff_eq!(first[0], 1.044_857, epsilon = 1e-5);
    assert_abs_diff_eq!(first[1], 1.444_749, epsilon = 1e-5);
    Ok(())
}

/// 测试高斯窗注意力的位置输入须为标量
#[test]
fn test_gauss_window_attention_location_shape() -> Result<(), RecError> {
    let (parent, _) = gauss_window_setup()?;
    let data = source_data(2, 1, 2, vec![2])?;
    let unit = json!({
        "att": {
            "class": "gauss_window_attention", "from": ["data:source"], "base": "base:enc",
            "window_size": 3
        },
        "output": { "class": "copy", "from": ["att"] },
    });
    let mut params = ParamStore::new_with_seed(0);
    let config = subnetwork_config(unit.clone(), json!({}))?;
    assert_err!(
        RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params),
        RecError::ShapeMismatch("att", [1], [2])
    );

    let mut unit = unit;
    unit["att"]["window_size"] = json!(0);
    let config = subnetwork_config(unit, json!({}))?;
    assert_err!(
        RecLayer::new("dec", config, &parent, &data, NetworkFlags::default(), &mut params),
        RecError::Config(_)
    );
    Ok(())
}
