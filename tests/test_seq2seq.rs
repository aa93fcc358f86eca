/*
 * @Author       : 老董
 * @Date         : 2026-02-12
 * @Description  : 编码-解码（seq2seq）的端到端测试：固定单元的LSTM编码器 + 带注意力与束搜索的子网络解码器
 *                 编码器：source(3) -> lstm(4)
 *                 解码器：prev:output/prev:s -> s(4) -> dot_attention(base:enc) -> prob(5) -> choice(beam 3)
 * @LastEditors  : 老董
 * @LastEditTime : 2026-02-12
 */
use only_torch_rec::errors::RecError;
use only_torch_rec::nn::{
    BaseLayer, ExternData, NetworkFlags, ParamStore, ParentNetwork, RecLayer, RecLayerConfig,
    SeqData,
};
use only_torch_rec::tensor::Tensor;
use serde_json::json;

/// 源序列：`[T=4, batch=2, 3]`，第二个样本只有2步有效
fn get_source() -> Result<SeqData, RecError> {
    let data = (0..24).map(|i| (i as f32 * 0.21).cos()).collect::<Vec<_>>();
    SeqData::new(Tensor::new(&data, &[4, 2, 3]), vec![4, 2])
}

fn decoder_config() -> Result<RecLayerConfig, RecError> {
    RecLayerConfig::from_json(json!({
        "unit": {
            "s": {
                "class": "linear", "from": ["prev:output", "prev:s"], "n_out": 4,
                "activation": "tanh"
            },
            "att": { "class": "dot_attention", "from": ["s"], "base": "base:enc" },
            "prob": {
                "class": "linear", "from": ["s", "att"], "n_out": 5, "activation": "softmax",
                "loss": "ce"
            },
            "output": { "class": "choice", "from": ["prob"], "beam_size": 3 },
            "end": { "class": "compare", "from": ["output"], "kind": "equal", "value": 0 }
        },
        "max_seq_len": 5
    }))
}

/// 运行编码器，并把其输出（转为批次主序）作为父网络中的`enc`层
fn encode(params: &mut ParamStore, data: &ExternData) -> Result<ParentNetwork, RecError> {
    let encoder = RecLayer::new(
        "enc",
        RecLayerConfig::cell("lstm", 4),
        &ParentNetwork::new(),
        data,
        NetworkFlags::training(),
        params,
    )?;
    let encoded = encoder.run(params, &ParentNetwork::new(), data)?;
    assert_eq!(encoded.output.shape(), &[4, 2, 4]);
    assert_eq!(encoded.seq_lens, vec![4, 2]);

    let value = encoded.output.swap_time_batch()?;
    Ok(ParentNetwork::new().with_layer(
        encoder.name(),
        BaseLayer::with_seq_lens(encoder.name(), value, encoded.seq_lens),
    ))
}

#[test]
fn test_seq2seq_teacher_forcing() -> Result<(), RecError> {
    let data = ExternData::new()
        .with(ExternData::SOURCE, get_source()?)
        .with("classes", SeqData::from_labels(&[vec![1, 2, 0], vec![3, 0]], 5)?);
    let mut params = ParamStore::new_with_seed(7);
    let parent = encode(&mut params, &data)?;

    let decoder = RecLayer::new(
        "dec",
        decoder_config()?,
        &parent,
        &data,
        NetworkFlags::training(),
        &mut params,
    )?;
    // 编码器的W、U、b与解码器s、prob层的W、b
    assert_eq!(params.len(), 7);

    let result = decoder.run(&params, &parent, &data)?;
    // 长度取自目标，选择取自目标
    assert_eq!(result.seq_lens, vec![3, 2]);
    assert_eq!(result.output.shape(), &[3, 2]);
    assert_eq!(result.output.data_as_vec(), vec![1., 3., 2., 0., 0., 0.]);

    let losses = result.losses.ok_or(RecError::MissingEndLayer)?;
    assert!(losses.total_loss.is_finite() && losses.total_loss > 0.0);
    assert!(losses.per_layer.contains_key("prob"));
    assert!((losses.norm_factor - 0.2).abs() < 1e-6);
    Ok(())
}

#[test]
fn test_seq2seq_beam_search() -> Result<(), RecError> {
    let data = ExternData::new().with(ExternData::SOURCE, get_source()?);
    let mut params = ParamStore::new_with_seed(7);
    let parent = encode(&mut params, &data)?;
    let decoder = RecLayer::new(
        "dec",
        decoder_config()?,
        &parent,
        &data,
        NetworkFlags::search(),
        &mut params,
    )?;

    let result = decoder.run(&params, &parent, &data)?;
    let time = result.output.shape()[0];
    assert!(time <= 5);
    assert_eq!(result.output.shape(), &[time, 6]);
    assert!(result.losses.is_none());
    let decided = result.decide()?;
    assert_eq!(decided.output.shape(), &[time, 2]);
    assert!(decided.seq_lens.iter().all(|&len| len <= 5));

    // 把标签0（即结束）的偏置调得极大：最佳假设在第0步就结束
    params.set("prob/b", Tensor::new(&[20., 0., 0., 0., 0.], &[5]))?;
    let decided = decoder.run(&params, &parent, &data)?.decide()?;
    assert_eq!(decided.seq_lens, vec![0, 0]);
    assert_eq!(decided.beam_indices, vec![0, 0]);
    Ok(())
}
