/*
 * @Author       : 老董
 * @Date         : 2026-02-03
 * @Description  : 错误类型：张量层面的`TensorError`与循环层（子网络解释器）层面的`RecError`
 */

use thiserror::Error;
mod ops;
pub use self::ops::*;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    // 张量二元运算
    #[error(
        "形状不一致，故无法{operator}：第一个张量的形状为{tensor1_shape:?}，第二个张量的形状为{tensor2_shape:?}"
    )]
    OperatorError {
        operator: Operator,
        tensor1_shape: Vec<usize>,
        tensor2_shape: Vec<usize>,
    },
    #[error("{value_name}须{operator}{threshold}，实际为{actual}")]
    ValueMustSatisfyComparison {
        value_name: String,
        operator: ComparisonOperator,
        threshold: usize,
        actual: usize,
    },
    #[error("张量的阶数须为{expected}，实际形状为{shape:?}")]
    RankMismatch { expected: usize, shape: Vec<usize> },
    #[error("索引{index}超出范围[0, {bound})")]
    IndexOutOfRange { index: usize, bound: usize },
    #[error("数据长度{data_len}与形状{shape:?}不匹配")]
    DataShapeMismatch { data_len: usize, shape: Vec<usize> },
    #[error("张量列表为空")]
    EmptyList,
    #[error("张量形状不一致")]
    InconsitentShape,
}

/// 循环层（rec layer）的错误类型
///
/// 按来源分为四类：
/// - 配置错误：构建模板图时发现（缺`output`层、引用不存在、同一时间步内的循环依赖等）
/// - 形状错误：实例化某一步或整理输出时发现
/// - 缺少输入：某一步需要的外部输入/目标未提供
/// - 不支持的操作：如向不暴露隐藏状态的单元索要最终隐藏状态
///
/// 所有错误都会立即中止整个构建/运行，不存在可恢复的中间状态。
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecError {
    #[error("子网络中缺少名为`output`的层")]
    MissingOutputLayer,
    #[error("序列长度事先未知时，子网络中必须有名为`end`的层")]
    MissingEndLayer,
    #[error("层`{layer}`引用了不存在的层/数据`{reference}`")]
    UnknownLayer { layer: String, reference: String },
    #[error("同一时间步内存在循环依赖：{}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
    #[error("配置错误：{0}")]
    Config(String),
    #[error("未知的循环单元类型`{0}`")]
    UnknownCell(String),
    #[error("未找到参数`{0}`")]
    UnknownParam(String),
    #[error("层`{layer}`的输出形状不符：期望{expected:?}，实际{got:?}")]
    ShapeMismatch {
        layer: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("长度不一致（期望{expected}，实际{got}）：{message}")]
    LengthMismatch {
        expected: usize,
        got: usize,
        message: String,
    },
    #[error("层`{layer}`需要的数据`{key}`未提供")]
    MissingInput { layer: String, key: String },
    #[error("不支持的操作：{0}")]
    Unsupported(String),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}
