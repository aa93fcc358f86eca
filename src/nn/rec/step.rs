/*
 * @Author       : 老董
 * @Date         : 2026-02-10
 * @Description  : 单步实例化器（第二遍）：给定上一步传来的状态与当前步号，
 *                 按拓扑序真正计算一个时间步内的各层，并产出下一步的状态。
 *                 层的数值公式全部委托给各层类型，这里只负责调度、绑定输入与传递状态
 */

use std::collections::BTreeMap;

use super::config::{InitialSource, InitialValue};
use super::kinds::{Choice, LayerKind, RecLayerKind, StepInputs};
use super::search::{BeamFrames, FrameId, filter_ended, initial_scores, select_top_k};
use super::template::{DepRef, DepScope, LayerTemplate, TemplateContext, TemplateGraph};
use crate::errors::RecError;
use crate::nn::{DataTemplate, ExternData, NetworkFlags, ParamStore, ParentNetwork};
use crate::tensor::Tensor;

/// 从第t步传到第t+1步的全部值
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CarriedState {
    /// 被`prev:`引用的层及选择点的输出
    pub outputs: BTreeMap<String, Tensor>,
    /// 各层的附加循环状态
    pub extra: BTreeMap<String, BTreeMap<String, Tensor>>,
    /// 搜索时当前假设的累计分数`[batch, beam]`
    pub beam_scores: Option<Tensor>,
}

/// 一步的计算结果
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// 本步计算过的各层的值，均已对齐到本步最终的束帧
    pub values: BTreeMap<String, Tensor>,
    pub carried: CarriedState,
    frames: BeamFrames,
}

impl StepOutcome {
    /// 本步各选择点依次记录的父行号
    pub fn parents(&self) -> Vec<Vec<usize>> {
        self.frames.chain()
    }

    /// 把按本步开头的行排列的逐行数据重排到本步结束时的行
    pub fn trace_rows<T: Copy>(&self, values: &[T]) -> Vec<T> {
        self.frames.align_rows(values, 0, self.frames.current())
    }
}

/// 绑定到某个依赖上的值
struct Bound<'a> {
    value: Tensor,
    frame: FrameId,
    seq_lens: Option<&'a [usize]>,
}

impl Bound<'_> {
    fn new(value: Tensor, frame: FrameId) -> Self {
        Self {
            value,
            frame,
            seq_lens: None,
        }
    }
}

/// 一步之内的工作区
struct StepEnv<'s> {
    step: usize,
    prev: &'s CarriedState,
    /// 按帧0的行排列的结束标志
    ended: &'s [bool],
    frames: BeamFrames,
    values: BTreeMap<String, (Tensor, FrameId)>,
    extra: BTreeMap<String, (BTreeMap<String, Tensor>, FrameId)>,
    /// 当前的假设分数及其所在帧
    scores: Option<(Tensor, usize)>,
}

pub struct StepInstantiator<'a> {
    graph: &'a TemplateGraph,
    params: &'a ParamStore,
    parent: &'a ParentNetwork,
    data: &'a ExternData,
    flags: NetworkFlags,
    batch: usize,
    /// 搜索时最后一个选择点的束宽，也就是每步开头与结尾的束宽
    beam: Option<usize>,
    /// 在循环内计算的层（拓扑序）
    in_loop: Vec<String>,
    dep_templates: BTreeMap<String, Vec<DataTemplate>>,
}

impl<'a> StepInstantiator<'a> {
    pub fn new(
        graph: &'a TemplateGraph,
        ctx: &TemplateContext<'a>,
        params: &'a ParamStore,
        batch: usize,
        in_loop: impl Fn(&str) -> bool,
    ) -> Result<Self, RecError> {
        let beam = match graph.choices().last() {
            Some(name) if ctx.flags.search_flag => graph.get(name)?.kind.beam_size(),
            _ => None,
        };
        let mut dep_templates = BTreeMap::new();
        for name in graph.order() {
            let layer = graph.get(name)?;
            let templates = graph
                .dep_templates(layer, ctx)?
                .into_iter()
                .map(|t| {
                    t.ok_or_else(|| RecError::Config(format!("无法推出层`{}`的输入形状", name)))
                })
                .collect::<Result<Vec<_>, _>>()?;
            dep_templates.insert(name.clone(), templates);
        }
        Ok(Self {
            graph,
            params,
            parent: ctx.parent,
            data: ctx.data,
            flags: ctx.flags,
            batch,
            beam,
            in_loop: graph.order().iter().filter(|n| in_loop(n)).cloned().collect(),
            dep_templates,
        })
    }

    pub fn beam(&self) -> Option<usize> {
        self.beam
    }

    /// 每步开头（与结尾）的行数
    pub fn rows(&self) -> usize {
        self.batch * self.beam.unwrap_or(1)
    }

    /// 第0步之前的状态：按各层的`initial_output`规则生成，缺省为全0
    pub fn initial_state(&self) -> Result<CarriedState, RecError> {
        let beam = self.beam.unwrap_or(1);
        let rows = self.rows();
        let mut carried = CarriedState::default();
        for name in self.graph.carried_outputs() {
            let layer = self.graph.get(&name)?;
            let shape = layer.output.value_shape(rows);
            let source = layer.initial_output.as_ref().map(InitialValue::source).transpose()?;
            let value = match source {
                None => Tensor::zeros(&shape),
                Some(InitialSource::Constant(v)) => Tensor::full(v, &shape),
                Some(InitialSource::Base(base)) => {
                    self.parent.require(&name, base)?.value.tile_rows(beam)?
                }
            };
            layer.output.check_value(&name, &value, rows)?;
            carried.outputs.insert(name, value);
        }
        for layer in self.graph.extra_state_layers() {
            carried
                .extra
                .insert(layer.name.clone(), layer.kind.initial_extra(&layer.output, rows)?);
        }
        if self.beam.is_some() {
            carried.beam_scores = Some(initial_scores(self.batch, beam)?);
        }
        Ok(carried)
    }

    /// 计算第`step`步。`ended`按本步开头的行排列；`preset`为已在循环外算好的层（每样本一行）
    pub fn step(
        &self,
        prev: &CarriedState,
        step: usize,
        ended: &[bool],
        preset: &BTreeMap<String, Tensor>,
    ) -> Result<StepOutcome, RecError> {
        let mut env = StepEnv {
            step,
            prev,
            ended,
            frames: BeamFrames::new(self.batch, self.beam.unwrap_or(1)),
            values: preset.iter().map(|(k, v)| (k.clone(), (v.clone(), None))).collect(),
            extra: BTreeMap::new(),
            scores: prev.beam_scores.clone().map(|scores| (scores, 0)),
        };
        for name in &self.in_loop {
            self.realize(&mut env, name)?;
        }
        self.finish(env)
    }

    /// 在循环外计算`names`（须为拓扑序），返回它们的值（每样本一行）
    pub fn realize_outside(
        &self,
        names: &[String],
        step: usize,
        preset: &BTreeMap<String, Tensor>,
    ) -> Result<BTreeMap<String, Tensor>, RecError> {
        let empty = CarriedState::default();
        let mut env = StepEnv {
            step,
            prev: &empty,
            ended: &[],
            frames: BeamFrames::new(self.batch, 1),
            values: preset.iter().map(|(k, v)| (k.clone(), (v.clone(), None))).collect(),
            extra: BTreeMap::new(),
            scores: None,
        };
        for name in names {
            self.realize(&mut env, name)?;
        }
        names
            .iter()
            .map(|name| {
                let (value, frame) = env
                    .values
                    .get(name)
                    .ok_or_else(|| RecError::Config(format!("循环外的层`{}`没有算出值", name)))?;
                Ok((name.clone(), env.frames.align(value, *frame, Some(0))?))
            })
            .collect()
    }

    /// 第`step`步的目标及其描述（用于损失）
    pub fn target(
        &self,
        layer: &LayerTemplate,
        step: usize,
    ) -> Result<Option<(Tensor, DataTemplate)>, RecError> {
        let Some(dep) = &layer.target else {
            return Ok(None);
        };
        let seq = self.data.require(&layer.name, &dep.name)?;
        Ok(Some((seq.frame(step)?, seq.frame_template(&dep.name))))
    }

    fn realize(&self, env: &mut StepEnv<'_>, name: &str) -> Result<(), RecError> {
        let layer = self.graph.get(name)?;

        // 1. 取出各依赖的值，并对齐到同一帧
        let bound = layer
            .deps
            .iter()
            .map(|dep| self.dep_value(env, layer, dep))
            .collect::<Result<Vec<_>, _>>()?;
        let mut frame = bound.iter().map(|b| b.frame).max().flatten();
        if layer.is_recurrent() {
            frame = frame.max(Some(0));
        }
        let sources = bound
            .iter()
            .map(|b| env.frames.align(&b.value, b.frame, frame))
            .collect::<Result<Vec<_>, _>>()?;

        // 2. 搜索时的选择点
        if let (LayerKind::Choice(choice), Some(_)) = (&layer.kind, self.beam) {
            return self.realize_choice(env, layer, choice, &sources, frame);
        }

        // 3. 绑定输入并计算
        let rows = env.frames.rows(frame);
        let row_batches = env.frames.row_batches(frame);
        let seq_lens = bound
            .iter()
            .map(|b| {
                b.seq_lens.map(|lens| {
                    row_batches
                        .iter()
                        .map(|&r| lens.get(r).copied().unwrap_or(0))
                        .collect()
                })
            })
            .collect();
        let prev_extra = env
            .prev
            .extra
            .get(name)
            .map(|extra| {
                extra
                    .iter()
                    .map(|(key, value)| Ok((key.clone(), env.frames.align(value, Some(0), frame)?)))
                    .collect::<Result<BTreeMap<_, _>, RecError>>()
            })
            .transpose()?;
        let target = match &layer.target {
            Some(dep) => {
                let b = self.dep_value(env, layer, dep)?;
                Some(env.frames.align(&b.value, b.frame, frame)?)
            }
            None => None,
        };
        let inputs = StepInputs {
            layer: name,
            sources: sources.iter().collect(),
            templates: self
                .dep_templates
                .get(name)
                .map(|t| t.iter().collect())
                .unwrap_or_default(),
            seq_lens,
            out: &layer.output,
            params: self.params,
            prev_extra: prev_extra.as_ref(),
            target: target.as_ref(),
            flags: self.flags,
            rows,
            step: env.step,
        };
        let result = layer.kind.step(&inputs)?;

        // 4. 校验声明的形状
        layer.output.check_value(name, &result.value, rows)?;
        env.values.insert(name.to_string(), (result.value, frame));
        if layer.kind.has_recurrent_state() {
            env.extra.insert(name.to_string(), (result.extra, frame));
        }
        Ok(())
    }

    fn realize_choice(
        &self,
        env: &mut StepEnv<'_>,
        layer: &LayerTemplate,
        choice: &Choice,
        sources: &[Tensor],
        frame: FrameId,
    ) -> Result<(), RecError> {
        let from = frame.unwrap_or_default();
        let source = sources
            .first()
            .ok_or_else(|| RecError::Config(format!("选择层`{}`缺少输入", layer.name)))?;

        // 已结束的假设只保留上一步的标签
        let ended = env.frames.align_rows(env.ended, 0, from);
        let mut log_probs = choice.log_scores(source);
        if ended.iter().any(|&e| e) {
            let prev = env.prev.outputs.get(&layer.name).ok_or_else(|| RecError::MissingInput {
                layer: layer.name.clone(),
                key: format!("prev:{}", layer.name),
            })?;
            let prev_labels = env.frames.align(prev, Some(0), Some(from))?.to_labels();
            log_probs = filter_ended(&log_probs, &ended, &prev_labels)?;
        }

        let (scores, scores_frame) = env
            .scores
            .take()
            .ok_or_else(|| RecError::Config("束搜索缺少假设分数".to_string()))?;
        let scores = env
            .frames
            .align(&scores.reshape(&[scores.size(), 1])?, Some(scores_frame), Some(from))?
            .reshape(&[self.batch, env.frames.beam(from)])?;
        let selected = select_top_k(&scores, &log_probs, choice.beam_size, &ended)?;

        let new_frame = env.frames.push(choice.beam_size, selected.src_beams);
        let value = Tensor::from_labels(&selected.labels);
        layer
            .output
            .check_value(&layer.name, &value, env.frames.rows(Some(new_frame)))?;
        env.values.insert(layer.name.clone(), (value, Some(new_frame)));
        env.scores = Some((selected.scores, new_frame));
        Ok(())
    }

    fn dep_value(
        &self,
        env: &StepEnv<'_>,
        layer: &LayerTemplate,
        dep: &DepRef,
    ) -> Result<Bound<'a>, RecError> {
        match dep.scope {
            DepScope::Same => env
                .values
                .get(&dep.name)
                .map(|(value, frame)| Bound::new(value.clone(), *frame))
                .ok_or_else(|| {
                    let message = format!("层`{}`的输入`{}`在本步尚未计算", layer.name, dep.name);
                    RecError::Config(message)
                }),
            DepScope::Prev => env
                .prev
                .outputs
                .get(&dep.name)
                .map(|value| Bound::new(value.clone(), Some(0)))
                .ok_or_else(|| RecError::MissingInput {
                    layer: layer.name.clone(),
                    key: dep.to_string(),
                }),
            DepScope::Base => {
                let parent: &'a ParentNetwork = self.parent;
                let base = parent.require(&layer.name, &dep.name)?;
                if layer.kind.reads_last_hidden_state() {
                    return Ok(Bound::new(base.hidden_state(&layer.name)?.clone(), None));
                }
                Ok(Bound {
                    value: base.value.clone(),
                    frame: None,
                    seq_lens: base.seq_lens.as_deref(),
                })
            }
            DepScope::Extern => Ok(Bound::new(
                self.data.require(&layer.name, &dep.name)?.frame(env.step)?,
                None,
            )),
            DepScope::StepIndex => {
                Ok(Bound::new(Tensor::full(env.step as f32, &[self.batch]), None))
            }
        }
    }

    /// 把本步的值对齐到最终帧，组装下一步的状态；搜索时已结束的假设保持上一步的状态
    fn finish(&self, env: StepEnv<'_>) -> Result<StepOutcome, RecError> {
        let last = Some(env.frames.current());
        let values = env
            .values
            .iter()
            .map(|(name, (value, frame))| {
                Ok((name.clone(), env.frames.align(value, *frame, last)?))
            })
            .collect::<Result<BTreeMap<_, _>, RecError>>()?;

        let frozen = self
            .beam
            .map(|_| env.frames.align_rows(env.ended, 0, env.frames.current()))
            .filter(|mask| mask.iter().any(|&e| e));
        let freeze = |value: Tensor, old: Option<&Tensor>| -> Result<Tensor, RecError> {
            match (&frozen, old) {
                (Some(mask), Some(old)) => {
                    let old = env.frames.align(old, Some(0), last)?;
                    Ok(Tensor::where_rows(mask, &old, &value)?)
                }
                _ => Ok(value),
            }
        };

        let mut carried = CarriedState::default();
        for name in self.graph.carried_outputs() {
            let value = values
                .get(&name)
                .cloned()
                .ok_or_else(|| RecError::Config(format!("需跨步传递的层`{}`不在循环内", name)))?;
            let value = freeze(value, env.prev.outputs.get(&name))?;
            carried.outputs.insert(name, value);
        }
        for (name, (extra, frame)) in &env.extra {
            let mut aligned = BTreeMap::new();
            for (key, value) in extra {
                let value = env.frames.align(value, *frame, last)?;
                let old = env.prev.extra.get(name).and_then(|e| e.get(key));
                aligned.insert(key.clone(), freeze(value, old)?);
            }
            carried.extra.insert(name.clone(), aligned);
        }
        carried.beam_scores = env.scores.as_ref().map(|(scores, _)| scores.clone());

        Ok(StepOutcome {
            values,
            carried,
            frames: env.frames,
        })
    }
}
