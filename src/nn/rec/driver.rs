/*
 * @Author       : 老董
 * @Date         : 2026-02-12
 * @Description  : 有界迭代驱动器：显式的状态机（Running/Done），
 *                 以纯函数`cond`判断是否继续，以`body`推进一步
 *
 * 长度约定（序列长度事先未知时）：每步先`end_flag |= end`，再给尚未结束的行长度加1。
 * 因此记录的长度等于`end`第一次触发时的步号；触发的那一步仍会执行，但不计入长度。
 * 输出按整个批次中最大的记录长度截断。
 */

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::hoist::HoistPlan;
use super::loss::{LayerLoss, LossSummary, masked_sum, step_loss};
use super::search::resolve_paths;
use super::step::{CarriedState, StepInstantiator};
use super::template::TemplateGraph;
use crate::errors::RecError;
use crate::nn::NetworkFlags;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Running,
    Done,
}

/// 循环的完整状态
#[derive(Debug, Clone)]
pub struct LoopState {
    pub step: usize,
    pub carried: CarriedState,
    /// 每行是否已发出结束信号
    pub end_flag: Vec<bool>,
    /// 每行的（已知或动态记录的）长度
    pub seq_lens: Vec<usize>,
    pub phase: LoopPhase,
}

/// 循环的上限
#[derive(Debug, Clone, PartialEq)]
pub struct LoopLimits {
    pub max_len: usize,
    /// 事先已知的逐样本长度；`None`表示由`end`层动态决定
    pub known_lens: Option<Vec<usize>>,
}

/// 逐步累积的输出缓冲
#[derive(Debug, Clone, Default)]
pub struct AccumulatedOutputs {
    buffers: BTreeMap<String, Vec<Tensor>>,
    /// 每一步各选择点依次记录的父行号
    parents: Vec<Vec<Vec<usize>>>,
}

impl AccumulatedOutputs {
    pub fn push(&mut self, key: &str, value: Tensor) {
        self.buffers.entry(key.to_string()).or_default().push(value);
    }

    pub fn get(&self, key: &str) -> &[Tensor] {
        self.buffers.get(key).map_or(&[], Vec::as_slice)
    }

    pub fn take(&mut self, key: &str) -> Vec<Tensor> {
        self.buffers.remove(key).unwrap_or_default()
    }

    pub fn parents(&self) -> &[Vec<Vec<usize>>] {
        &self.parents
    }

    /// 已执行的步数
    pub fn steps(&self) -> usize {
        self.parents.len()
    }
}

/// 循环（连同循环前后的计算）的结果
#[derive(Debug, Clone)]
pub struct LoopResult {
    /// `[T, rows, ...]`，搜索时已回溯
    pub output: Tensor,
    pub seq_lens: Vec<usize>,
    pub steps: usize,
    /// 搜索时最终假设的分数`[batch, beam]`
    pub beam_scores: Option<Tensor>,
    pub losses: Option<LossSummary>,
    /// 最后一步各层的附加循环状态，行序与`beam_scores`一致
    pub last_extra: BTreeMap<String, BTreeMap<String, Tensor>>,
}

pub struct IterationDriver<'a> {
    layer: &'a str,
    graph: &'a TemplateGraph,
    instantiator: &'a StepInstantiator<'a>,
    plan: &'a HoistPlan,
    limits: LoopLimits,
    flags: NetworkFlags,
    /// 循环内每步需要累积的值：`output`以及循环后各层的输入
    tracked: BTreeSet<String>,
}

impl<'a> IterationDriver<'a> {
    pub fn new(
        layer: &'a str,
        graph: &'a TemplateGraph,
        instantiator: &'a StepInstantiator<'a>,
        plan: &'a HoistPlan,
        limits: LoopLimits,
        flags: NetworkFlags,
    ) -> Self {
        let mut tracked = BTreeSet::from([TemplateGraph::OUTPUT.to_string()]);
        for name in plan.after() {
            if let Some(layer) = graph.layer(name) {
                tracked.extend(layer.same_deps().map(str::to_string));
            }
        }
        tracked.retain(|name| !plan.after().contains(name));
        Self {
            layer,
            graph,
            instantiator,
            plan,
            limits,
            flags,
            tracked,
        }
    }

    /// 是否继续：未到最大步数，且（长度已知，或仍有行未结束）
    pub fn cond(&self, state: &LoopState) -> bool {
        state.step < self.limits.max_len
            && (self.limits.known_lens.is_some() || state.end_flag.iter().any(|&ended| !ended))
    }

    fn collect_losses(&self) -> bool {
        self.flags.eval_flag && self.instantiator.beam().is_none()
    }

    pub fn run(&self) -> Result<LoopResult, RecError> {
        // 1. 循环前的层
        let before = self.realize_before()?;

        // 2. 初始状态
        let rows = self.instantiator.rows();
        let beam = self.instantiator.beam().unwrap_or(1);
        let seq_lens = match &self.limits.known_lens {
            Some(lens) => lens.iter().flat_map(|&len| std::iter::repeat_n(len, beam)).collect(),
            None => vec![0; rows],
        };
        let mut state = LoopState {
            step: 0,
            carried: self.instantiator.initial_state()?,
            end_flag: vec![false; rows],
            seq_lens,
            phase: LoopPhase::Running,
        };
        state.phase = if self.cond(&state) { LoopPhase::Running } else { LoopPhase::Done };

        // 3. 循环
        let mut acc = AccumulatedOutputs::default();
        let empty = BTreeMap::new();
        while state.phase == LoopPhase::Running {
            let preset = before.get(state.step).unwrap_or(&empty);
            state = self.body(state, preset, &mut acc)?;
        }
        let steps = acc.steps();

        // 4. 循环后的层
        self.realize_after(&before, &mut acc)?;

        // 5. 整理输出
        let outputs = acc.take(TemplateGraph::OUTPUT);
        let outputs = if self.instantiator.beam().is_some() {
            resolve_paths(&outputs, acc.parents())?
        } else {
            outputs
        };
        let out_len = match &self.limits.known_lens {
            Some(_) => steps,
            None => state.seq_lens.iter().copied().max().unwrap_or(0),
        };
        let output = match outputs.get(..out_len) {
            Some(frames) if !frames.is_empty() => Tensor::stack(frames)?,
            _ => {
                let mut shape = vec![0];
                shape.extend(self.graph.output().output.value_shape(rows));
                Tensor::zeros(&shape)
            }
        };

        let losses = if self.collect_losses() {
            Some(self.summarize_losses(&acc, &state.seq_lens))
        } else {
            None
        };
        Ok(LoopResult {
            output,
            seq_lens: state.seq_lens,
            steps,
            beam_scores: state.carried.beam_scores,
            losses,
            last_extra: state.carried.extra,
        })
    }

    /// 推进一步
    fn body(
        &self,
        state: LoopState,
        preset: &BTreeMap<String, Tensor>,
        acc: &mut AccumulatedOutputs,
    ) -> Result<LoopState, RecError> {
        let outcome = self
            .instantiator
            .step(&state.carried, state.step, &state.end_flag, preset)?;

        // 1. 累积本步的值
        for key in &self.tracked {
            let value = outcome
                .values
                .get(key)
                .ok_or_else(|| {
                    RecError::Config(format!("第{}步没有算出需累积的层`{}`", state.step, key))
                })?;
            acc.push(key, value.clone());
        }
        acc.parents.push(outcome.parents());

        // 2. 损失
        if self.collect_losses() {
            for layer in self.graph.loss_layers() {
                if self.plan.after().contains(&layer.name) {
                    continue;
                }
                if let Some(value) = outcome.values.get(&layer.name) {
                    self.push_loss(acc, &layer.name, value, state.step)?;
                }
            }
        }

        // 3. 长度与结束标志
        let mut end_flag = outcome.trace_rows(&state.end_flag);
        let mut seq_lens = outcome.trace_rows(&state.seq_lens);
        if self.limits.known_lens.is_none() {
            let end = outcome
                .values
                .get(TemplateGraph::END)
                .ok_or(RecError::MissingEndLayer)?
                .to_flags();
            for ((flag, len), end) in end_flag.iter_mut().zip(seq_lens.iter_mut()).zip(end) {
                *flag |= end;
                if !*flag {
                    *len += 1;
                }
            }
        }
        debug!(
            layer = self.layer,
            step = state.step,
            active = end_flag.iter().filter(|&&e| !e).count(),
            "循环步完成"
        );

        let mut next = LoopState {
            step: state.step + 1,
            carried: outcome.carried,
            end_flag,
            seq_lens,
            phase: LoopPhase::Running,
        };
        if !self.cond(&next) {
            next.phase = LoopPhase::Done;
        }
        Ok(next)
    }

    /// 每步循环前的层的值；与步号无关者只算一次
    fn realize_before(&self) -> Result<Vec<BTreeMap<String, Tensor>>, RecError> {
        if self.plan.before().is_empty() {
            return Ok(Vec::new());
        }
        let invariant = self.plan.step_invariant(self.graph);
        let variant = self
            .plan
            .before()
            .difference(&invariant)
            .cloned()
            .collect::<BTreeSet<_>>();
        let once = self
            .instantiator
            .realize_outside(&self.plan.ordered(self.graph, &invariant), 0, &BTreeMap::new())?;
        let variant_order = self.plan.ordered(self.graph, &variant);
        (0..self.limits.max_len)
            .map(|t| {
                let mut values = self.instantiator.realize_outside(&variant_order, t, &once)?;
                values.extend(once.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(values)
            })
            .collect()
    }

    /// 由累积的循环内的值逐步计算循环后的层
    fn realize_after(
        &self,
        before: &[BTreeMap<String, Tensor>],
        acc: &mut AccumulatedOutputs,
    ) -> Result<(), RecError> {
        if self.plan.after().is_empty() {
            return Ok(());
        }
        let order = self.plan.ordered(self.graph, self.plan.after());
        for t in 0..acc.steps() {
            let mut preset = before.get(t).cloned().unwrap_or_default();
            for key in &self.tracked {
                if let Some(value) = acc.get(key).get(t) {
                    preset.insert(key.clone(), value.clone());
                }
            }
            let values = self.instantiator.realize_outside(&order, t, &preset)?;
            if let Some(output) = values.get(TemplateGraph::OUTPUT) {
                acc.push(TemplateGraph::OUTPUT, output.clone());
            }
            if self.collect_losses() {
                for layer in self.graph.loss_layers() {
                    if let Some(value) = values.get(&layer.name) {
                        self.push_loss(acc, &layer.name, value, t)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn push_loss(
        &self,
        acc: &mut AccumulatedOutputs,
        name: &str,
        value: &Tensor,
        step: usize,
    ) -> Result<(), RecError> {
        let layer = self.graph.get(name)?;
        let target = self.instantiator.target(layer, step)?;
        let (Some(kind), Some((target, template))) = (layer.loss, target) else {
            return Ok(());
        };
        let (loss, error) = step_loss(kind, value, &target, &template)?;
        acc.push(&loss_key(name), loss);
        if let Some(error) = error {
            acc.push(&error_key(name), error);
        }
        Ok(())
    }

    fn summarize_losses(&self, acc: &AccumulatedOutputs, seq_lens: &[usize]) -> LossSummary {
        let per_layer = self
            .graph
            .loss_layers()
            .map(|layer| {
                let loss = masked_sum(acc.get(&loss_key(&layer.name)), seq_lens) * layer.loss_scale;
                let errors = acc.get(&error_key(&layer.name));
                let error = (!errors.is_empty()).then(|| masked_sum(errors, seq_lens));
                (layer.name.clone(), LayerLoss { loss, error })
            })
            .collect();
        LossSummary::new(per_layer, seq_lens)
    }
}

fn loss_key(layer: &str) -> String {
    format!("loss_{}", layer)
}

fn error_key(layer: &str) -> String {
    format!("error_{}", layer)
}
