/*
 * @Author       : 老董
 * @Date         : 2026-02-12
 * @Description  : 循环层（rec layer）：沿时间轴展开一个“单元”
 *
 * 单元在构建时确定为以下四种执行策略之一（[`RecUnit`]）：
 * - 逐步单元（GenericCell）：每步调用一次固定单元
 * - 融合核单元（FusedKernelCell）：整段输入投影一次完成，再做门递推
 * - 多层融合单元（VendorFusedCell）：多层堆叠的融合核
 * - 子网络单元（SubnetworkCell）：任意的具名层图，每步解释执行一次，
 *   支持`prev:`自引用、动态长度与束搜索
 */

pub mod cells;
pub mod config;
pub mod driver;
pub mod fused;
pub mod hoist;
pub mod kinds;
pub mod loss;
pub mod search;
pub mod step;
pub mod template;

pub use config::{InitialValue, LayerDesc, LossKind, RecLayerConfig, UnitDesc};
pub use search::Decided;

use std::collections::BTreeMap;

use self::cells::{CellImpl, CellType, lookup_cell};
use self::config::InitialSource;
use self::driver::{IterationDriver, LoopLimits};
use self::fused::{CellWeights, SeqRun, run_fused, run_generic, run_multi_layer};
use self::hoist::HoistPlan;
use self::loss::LossSummary;
use self::step::StepInstantiator;
use self::template::{TemplateContext, TemplateGraph};
use crate::errors::RecError;
use crate::nn::{DataTemplate, ExternData, NetworkFlags, ParamStore, ParentNetwork, SeqData};
use crate::tensor::Tensor;

/// 子网络单元：模板图与移出循环的划分，都在构建时确定
#[derive(Debug, Clone)]
pub struct Subnetwork {
    graph: TemplateGraph,
    plan: HoistPlan,
}

impl Subnetwork {
    pub fn graph(&self) -> &TemplateGraph {
        &self.graph
    }

    pub fn plan(&self) -> &HoistPlan {
        &self.plan
    }
}

/// 单元的执行策略
#[derive(Debug, Clone)]
pub enum RecUnit {
    GenericCell(CellType),
    FusedKernelCell,
    VendorFusedCell { cell: CellType, num_layers: usize },
    SubnetworkCell(Box<Subnetwork>),
}

impl RecUnit {
    pub fn cell_type(&self) -> Option<CellType> {
        match self {
            Self::GenericCell(cell) | Self::VendorFusedCell { cell, .. } => Some(*cell),
            Self::FusedKernelCell => Some(CellType::Lstm),
            Self::SubnetworkCell(_) => None,
        }
    }
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct RecOutput {
    /// `[T, rows, ...]`，rows为batch（搜索时为batch*beam）
    pub output: Tensor,
    /// 每行的有效长度
    pub seq_lens: Vec<usize>,
    pub template: DataTemplate,
    /// 搜索时最终假设的分数`[batch, beam]`
    pub beam_scores: Option<Tensor>,
    pub losses: Option<LossSummary>,
    /// 实际执行的步数
    pub steps: usize,
    last_state: Option<Tensor>,
    /// 子网络中各层最后一步的附加循环状态
    layer_states: BTreeMap<String, BTreeMap<String, Tensor>>,
}

impl RecOutput {
    /// 最后一步的隐藏状态`[rows, state_size]`。
    /// 固定单元取单元状态；子网络单元取`output`层的循环状态（见[`Self::last_state_of`]）
    pub fn last_hidden_state(&self) -> Result<&Tensor, RecError> {
        match &self.last_state {
            Some(state) => Ok(state),
            None => self.last_state_of(TemplateGraph::OUTPUT),
        }
    }

    /// 子网络中某层在最后一步的循环状态（如`rnn_cell`的`state`），行序与输出一致。
    /// 取最后执行的一步的状态；搜索时已结束的假设保持其结束那一步的值
    pub fn last_state_of(&self, layer: &str) -> Result<&Tensor, RecError> {
        self.layer_states
            .get(layer)
            .and_then(|extra| extra.get(kinds::STATE_KEY))
            .ok_or_else(|| RecError::Unsupported(format!("层`{}`没有循环状态", layer)))
    }

    /// 每个样本取分数最高的假设；未做搜索时原样返回
    pub fn decide(&self) -> Result<Decided, RecError> {
        match &self.beam_scores {
            Some(scores) => search::decide(&self.output, scores, &self.seq_lens),
            None => Ok(Decided {
                output: self.output.clone(),
                seq_lens: self.seq_lens.clone(),
                scores: vec![0.0; self.seq_lens.len()],
                beam_indices: vec![0; self.seq_lens.len()],
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecLayer {
    name: String,
    config: RecLayerConfig,
    unit: RecUnit,
    output: DataTemplate,
    batch: usize,
    flags: NetworkFlags,
}

impl RecLayer {
    /// 构建循环层：确定执行策略、构建模板图并创建参数
    pub fn new(
        name: &str,
        config: RecLayerConfig,
        parent: &ParentNetwork,
        data: &ExternData,
        flags: NetworkFlags,
        params: &mut ParamStore,
    ) -> Result<Self, RecError> {
        // 1. 必要的验证
        if config.direction != 1 && config.direction != -1 {
            return Err(RecError::Config(format!(
                "循环层`{}`的direction须为1或-1，实际为{}",
                name, config.direction
            )));
        }
        let batch = resolve_batch(parent, data, &config.target)?;

        // 2. 确定执行策略
        let (unit, output) = match &config.unit {
            UnitDesc::Cell(cell) => build_cell(name, &config, cell, data, params)?,
            UnitDesc::Subnetwork(layers) => {
                let ctx = TemplateContext {
                    parent,
                    data,
                    flags,
                    default_target: &config.target,
                };
                build_subnetwork(name, &config, layers, &ctx, params)?
            }
        };

        Ok(Self {
            name: name.to_string(),
            config,
            unit,
            output,
            batch,
            flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> &RecUnit {
        &self.unit
    }

    pub fn output(&self) -> &DataTemplate {
        &self.output
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn subnetwork(&self) -> Option<&Subnetwork> {
        match &self.unit {
            RecUnit::SubnetworkCell(sub) => Some(sub),
            _ => None,
        }
    }

    pub fn run(
        &self,
        params: &ParamStore,
        parent: &ParentNetwork,
        data: &ExternData,
    ) -> Result<RecOutput, RecError> {
        match &self.unit {
            RecUnit::SubnetworkCell(sub) => self.run_subnetwork(sub, params, parent, data),
            _ => self.run_cell(params, parent, data),
        }
    }

    fn run_subnetwork(
        &self,
        sub: &Subnetwork,
        params: &ParamStore,
        parent: &ParentNetwork,
        data: &ExternData,
    ) -> Result<RecOutput, RecError> {
        // 1. 长度
        let known = known_lens(&sub.graph, &self.config, data, self.flags)?;
        let max_len = match &known {
            Some(lens) => lens.iter().copied().max().unwrap_or(0),
            None => {
                if !sub.graph.has_end() {
                    return Err(RecError::MissingEndLayer);
                }
                self.config.max_seq_len.ok_or_else(|| missing_max_seq_len(&self.name))?
            }
        };

        // 2. 反向时先在各自长度内反转外部数据
        let reversed;
        let data = if self.config.direction == -1 {
            if known.is_none() {
                return Err(reverse_needs_length(&self.name));
            }
            let mut flipped = ExternData::new();
            for key in data.keys() {
                flipped.insert(key, data.require(&self.name, key)?.reversed()?);
            }
            reversed = flipped;
            &reversed
        } else {
            data
        };

        // 3. 循环
        let ctx = TemplateContext {
            parent,
            data,
            flags: self.flags,
            default_target: &self.config.target,
        };
        let in_loop = |name: &str| sub.plan.in_loop().contains(name);
        let instantiator = StepInstantiator::new(&sub.graph, &ctx, params, self.batch, in_loop)?;
        let limits = LoopLimits {
            max_len,
            known_lens: known,
        };
        let driver = IterationDriver::new(
            &self.name,
            &sub.graph,
            &instantiator,
            &sub.plan,
            limits,
            self.flags,
        );
        let result = driver.run()?;

        let output = if self.config.direction == -1 {
            result.output.reverse_within_lengths(&result.seq_lens)?
        } else {
            result.output
        };
        Ok(RecOutput {
            output,
            seq_lens: result.seq_lens,
            template: self.output.clone(),
            beam_scores: result.beam_scores,
            losses: result.losses,
            steps: result.steps,
            last_state: None,
            layer_states: result.last_extra,
        })
    }

    fn run_cell(
        &self,
        params: &ParamStore,
        parent: &ParentNetwork,
        data: &ExternData,
    ) -> Result<RecOutput, RecError> {
        let source = data.require(&self.name, ExternData::SOURCE)?;
        let lens = source.seq_lens();
        let mut x = cell_input(source)?;
        if self.config.direction == -1 {
            x = x.reverse_within_lengths(lens)?;
        }
        let n = self.output.feature_dim().unwrap_or(0);
        let cell = self
            .unit
            .cell_type()
            .ok_or_else(|| RecError::Unsupported("子网络单元没有整段执行的核".to_string()))?;
        let initial = self.initial_cell_state(parent, cell.state_size(n))?;

        let SeqRun { output, last_state } = match &self.unit {
            RecUnit::GenericCell(cell) => {
                let weights = CellWeights::load(params, &self.name)?;
                run_generic(*cell, n, &x, lens, initial, &weights)?
            }
            RecUnit::FusedKernelCell => {
                let weights = CellWeights::load(params, &self.name)?;
                run_fused(CellType::Lstm, n, &x, lens, initial, &weights)?
            }
            RecUnit::VendorFusedCell { cell, num_layers } => {
                run_multi_layer(*cell, n, *num_layers, &x, lens, &initial, params, &self.name)?
            }
            RecUnit::SubnetworkCell(_) => {
                return Err(RecError::Unsupported("子网络单元没有整段执行的核".to_string()));
            }
        };
        let output = if self.config.direction == -1 {
            output.reverse_within_lengths(lens)?
        } else {
            output
        };
        Ok(RecOutput {
            steps: output.rows(),
            output,
            seq_lens: lens.to_vec(),
            template: self.output.clone(),
            beam_scores: None,
            losses: None,
            last_state: Some(last_state),
            layer_states: BTreeMap::new(),
        })
    }

    /// 固定单元的初始状态`[batch, state_size]`
    fn initial_cell_state(&self, parent: &ParentNetwork, size: usize) -> Result<Tensor, RecError> {
        let shape = [self.batch, size];
        let source = self.config.initial_state.as_ref().map(InitialValue::source).transpose()?;
        let value = match source {
            None => Tensor::zeros(&shape),
            Some(InitialSource::Constant(v)) => Tensor::full(v, &shape),
            Some(InitialSource::Base(base)) => parent.require(&self.name, base)?.value.clone(),
        };
        if value.shape() != shape {
            return Err(RecError::ShapeMismatch {
                layer: self.name.clone(),
                expected: shape.to_vec(),
                got: value.shape().to_vec(),
            });
        }
        Ok(value)
    }
}

/// 批大小依次取自：逐步输入、目标、父网络显式给出的值、父网络的第一层
fn resolve_batch(
    parent: &ParentNetwork,
    data: &ExternData,
    target: &str,
) -> Result<usize, RecError> {
    data.source()
        .or_else(|| data.get(target))
        .map(SeqData::batch)
        .or(parent.batch_dim)
        .or_else(|| parent.layers().next().map(|(_, layer)| layer.batch()))
        .ok_or_else(|| {
            RecError::Config("无法确定批大小：没有逐步输入、目标，父网络也未给出batch_dim".to_string())
        })
}

fn build_cell(
    name: &str,
    config: &RecLayerConfig,
    cell_name: &str,
    data: &ExternData,
    params: &mut ParamStore,
) -> Result<(RecUnit, DataTemplate), RecError> {
    let n = config
        .n_out
        .ok_or_else(|| RecError::Config(format!("循环层`{}`使用固定单元时须给出n_out", name)))?;
    let (_, cell_impl) = lookup_cell(cell_name)?;
    let source = data.require(name, ExternData::SOURCE)?;
    let n_in = source.frame_template(ExternData::SOURCE).feature_dim().unwrap_or(1);

    let unit = match cell_impl {
        CellImpl::Generic(cell) => {
            cell.create_params(name, n_in, n, params)?;
            RecUnit::GenericCell(cell)
        }
        CellImpl::NativeLstm => {
            CellType::Lstm.create_params(name, n_in, n, params)?;
            RecUnit::FusedKernelCell
        }
        CellImpl::BlockFused(cell) => {
            if config.num_layers == 0 {
                return Err(RecError::Config(format!("循环层`{}`的num_layers须大于0", name)));
            }
            for layer in 0..config.num_layers {
                let n_in = if layer == 0 { n_in } else { n };
                cell.create_params(&format!("{}/layer{}", name, layer), n_in, n, params)?;
            }
            RecUnit::VendorFusedCell {
                cell,
                num_layers: config.num_layers,
            }
        }
    };
    Ok((unit, DataTemplate::dense(name, n)))
}

fn build_subnetwork(
    name: &str,
    config: &RecLayerConfig,
    layers: &BTreeMap<String, LayerDesc>,
    ctx: &TemplateContext<'_>,
    params: &mut ParamStore,
) -> Result<(RecUnit, DataTemplate), RecError> {
    let graph = TemplateGraph::build(layers, ctx, params)?;
    let out = &graph.output().output;
    if let Some(n_out) = config.n_out {
        if out.feature_dim() != Some(n_out) {
            return Err(RecError::ShapeMismatch {
                layer: name.to_string(),
                expected: vec![n_out],
                got: out.shape.clone(),
            });
        }
    }

    // 长度事先未知时须有`end`层和最大步数
    if known_lens(&graph, config, ctx.data, ctx.flags)?.is_none() {
        if !graph.has_end() {
            return Err(RecError::MissingEndLayer);
        }
        if config.max_seq_len.is_none() {
            return Err(missing_max_seq_len(name));
        }
        if config.direction == -1 {
            return Err(reverse_needs_length(name));
        }
    }

    let searching = ctx.flags.search_flag && !graph.choices().is_empty();
    let plan = HoistPlan::analyze(&graph, config.optimize_move_layers_out && !searching);
    plan.report(name);

    let output = out.renamed(name);
    Ok((RecUnit::SubnetworkCell(Box::new(Subnetwork { graph, plan })), output))
}

/// 事先已知的逐样本长度：取自逐步输入，否则（非搜索时）取自目标；两者都有时须一致
fn known_lens(
    graph: &TemplateGraph,
    config: &RecLayerConfig,
    data: &ExternData,
    flags: NetworkFlags,
) -> Result<Option<Vec<usize>>, RecError> {
    let keys = graph.extern_keys();
    let source = data.source().filter(|_| keys.contains(ExternData::SOURCE));
    let target = data
        .get(&config.target)
        .filter(|_| !flags.search_flag && keys.contains(&config.target));
    match (source, target) {
        (Some(source), Some(target)) => {
            if source.batch() != target.batch() {
                return Err(RecError::LengthMismatch {
                    expected: source.batch(),
                    got: target.batch(),
                    message: "目标与输入的批大小不一致".to_string(),
                });
            }
            if let Some((b, (s, t))) = source
                .seq_lens()
                .iter()
                .zip(target.seq_lens())
                .enumerate()
                .find(|(_, (s, t))| s != t)
            {
                return Err(RecError::LengthMismatch {
                    expected: *s,
                    got: *t,
                    message: format!("第{}个样本的目标长度与输入长度不一致", b),
                });
            }
            Ok(Some(source.seq_lens().to_vec()))
        }
        (Some(seq), None) | (None, Some(seq)) => Ok(Some(seq.seq_lens().to_vec())),
        (None, None) => Ok(None),
    }
}

/// 固定单元的输入：`[T, B, n_in]`；稀疏输入转one-hot
fn cell_input(source: &SeqData) -> Result<Tensor, RecError> {
    let data = source.data();
    let (time, batch) = (data.shape()[0], data.shape()[1]);
    let template = source.frame_template(ExternData::SOURCE);
    if template.sparse {
        let dim = template.dim.unwrap_or(0);
        return Ok(data.reshape(&[time * batch])?.one_hot(dim)?.reshape(&[time, batch, dim])?);
    }
    let features = data.shape()[2..].iter().product::<usize>();
    Ok(data.reshape(&[time, batch, features])?)
}

fn missing_max_seq_len(name: &str) -> RecError {
    RecError::Config(format!("循环层`{}`的序列长度事先未知，须给出max_seq_len", name))
}

fn reverse_needs_length(name: &str) -> RecError {
    RecError::Config(format!("循环层`{}`反向运行时序列长度须事先已知", name))
}
