/*
 * @Author       : 老董
 * @Date         : 2026-02-08
 * @Description  : 层模板图（第一遍）：只做名字解析、依赖分析与形状推导，不做任何数值计算
 *
 * 引用语法：
 * - `x`       同一时间步的层x
 * - `prev:x`  上一时间步的层x（x会被记入全局的`prev_layers_needed`）
 * - `base:x`  父网络中的层x
 * - `data:k`  外部数据k在本步的一帧（`data:source`为逐步输入，其余多为目标）
 * - `:i`      当前步号
 */

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::trace;

use super::config::{InitialSource, InitialValue, LayerDesc, LossKind};
use super::kinds::{LayerKind, RecLayerKind};
use crate::errors::RecError;
use crate::nn::{DType, DataTemplate, ExternData, NetworkFlags, ParamStore, ParentNetwork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepScope {
    Same,
    Prev,
    Base,
    Extern,
    StepIndex,
}

/// 解析后的依赖引用
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DepRef {
    pub scope: DepScope,
    pub name: String,
}

impl DepRef {
    pub const STEP_INDEX: &'static str = ":i";

    pub fn parse(text: &str) -> Self {
        let (scope, name) = if text == Self::STEP_INDEX {
            (DepScope::StepIndex, text)
        } else if let Some(name) = text.strip_prefix("prev:") {
            (DepScope::Prev, name)
        } else if let Some(name) = text.strip_prefix("base:") {
            (DepScope::Base, name)
        } else if let Some(name) = text.strip_prefix("data:") {
            (DepScope::Extern, name)
        } else {
            (DepScope::Same, text)
        };
        Self {
            scope,
            name: name.to_string(),
        }
    }

    pub fn data(key: &str) -> Self {
        Self {
            scope: DepScope::Extern,
            name: key.to_string(),
        }
    }
}

impl fmt::Display for DepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            DepScope::Same => write!(f, "{}", self.name),
            DepScope::Prev => write!(f, "prev:{}", self.name),
            DepScope::Base => write!(f, "base:{}", self.name),
            DepScope::Extern => write!(f, "data:{}", self.name),
            DepScope::StepIndex => write!(f, "{}", Self::STEP_INDEX),
        }
    }
}

/// 一层的模板：构建后不再改变
#[derive(Debug, Clone)]
pub struct LayerTemplate {
    pub name: String,
    pub kind: LayerKind,
    pub output: DataTemplate,
    /// 先`from`，后层类型的附加引用
    pub deps: Vec<DepRef>,
    /// 教师强制/损失所用的外部数据
    pub target: Option<DepRef>,
    pub loss: Option<LossKind>,
    pub loss_scale: f32,
    pub initial_output: Option<InitialValue>,
}

impl LayerTemplate {
    pub fn same_deps(&self) -> impl Iterator<Item = &str> {
        self.deps_in(DepScope::Same)
    }

    pub fn prev_deps(&self) -> impl Iterator<Item = &str> {
        self.deps_in(DepScope::Prev)
    }

    fn deps_in(&self, scope: DepScope) -> impl Iterator<Item = &str> {
        self.deps
            .iter()
            .filter(move |d| d.scope == scope)
            .map(|d| d.name.as_str())
    }

    pub fn is_choice(&self) -> bool {
        self.kind.beam_size().is_some()
    }

    /// 是否带跨步状态（附加循环状态或选择点）
    pub fn is_recurrent(&self) -> bool {
        self.kind.has_recurrent_state() || self.is_choice()
    }

    /// 本层（直接）依赖外部逐步数据或步号
    pub fn reads_step_data(&self) -> bool {
        self.deps
            .iter()
            .chain(self.target.iter())
            .any(|d| matches!(d.scope, DepScope::Extern | DepScope::StepIndex))
    }
}

/// 构建模板图所需的外部环境
pub struct TemplateContext<'a> {
    pub parent: &'a ParentNetwork,
    pub data: &'a ExternData,
    pub flags: NetworkFlags,
    /// 层未指定`target`时使用的目标数据键
    pub default_target: &'a str,
}

/// 子网络的模板图
#[derive(Debug, Clone)]
pub struct TemplateGraph {
    layers: BTreeMap<String, LayerTemplate>,
    /// 同一时间步内的拓扑序（依赖在前）
    order: Vec<String>,
    prev_layers_needed: BTreeSet<String>,
    /// 按拓扑序排列的选择点
    choices: Vec<String>,
}

impl TemplateGraph {
    pub const OUTPUT: &'static str = "output";
    pub const END: &'static str = "end";

    /// 从`output`（及`end`、带损失的层）出发递归解析所有引用，推导形状并创建参数
    pub fn build(
        unit: &BTreeMap<String, LayerDesc>,
        ctx: &TemplateContext<'_>,
        params: &mut ParamStore,
    ) -> Result<Self, RecError> {
        // 1. 必要的验证
        if !unit.contains_key(Self::OUTPUT) {
            return Err(RecError::MissingOutputLayer);
        }

        // 2. 收集所有需要构建的层，同时解析引用
        let (mut layers, prev_layers_needed) = Self::collect(unit, ctx)?;

        // 3. 同一时间步内的拓扑排序（顺带检测循环依赖）
        let order = Self::sort(&layers)?;

        // 4. 形状推导（不动点迭代）
        Self::infer_templates(&mut layers, &order, ctx)?;
        if let Some(end) = layers.get(Self::END) {
            if end.output.dtype != DType::Bool || !end.output.shape.is_empty() {
                return Err(RecError::Config(format!(
                    "`end`层须为每行一个布尔标志，实际为{:?}（{:?}）",
                    end.output.shape, end.output.dtype
                )));
            }
        }

        // 5. 束宽的传播与选择点检查
        let choices = Self::propagate_beams(&mut layers, &order, ctx.flags)?;

        let graph = Self {
            layers,
            order,
            prev_layers_needed,
            choices,
        };

        // 6. 创建参数
        for name in &graph.order {
            let layer = &graph.layers[name];
            let sources = graph.dep_templates(layer, ctx)?;
            let sources = sources
                .iter()
                .map(|t| {
                    t.as_ref().ok_or_else(|| {
                        RecError::Config(format!("无法推出层`{}`的输入形状", layer.name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            layer.kind.create_params(name, &sources, &layer.output, params)?;
            trace!(
                layer = %name,
                deps = ?layer.deps.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
                shape = ?layer.output.shape,
                "构建层模板"
            );
        }
        Ok(graph)
    }

    fn collect(
        unit: &BTreeMap<String, LayerDesc>,
        ctx: &TemplateContext<'_>,
    ) -> Result<(BTreeMap<String, LayerTemplate>, BTreeSet<String>), RecError> {
        let mut layers = BTreeMap::new();
        let mut prev_layers_needed = BTreeSet::new();
        let mut pending = vec![Self::OUTPUT.to_string()];
        if unit.contains_key(Self::END) {
            pending.push(Self::END.to_string());
        }
        if ctx.flags.eval_flag {
            pending.extend(
                unit.iter()
                    .filter(|(_, desc)| desc.loss.is_some())
                    .map(|(name, _)| name.clone()),
            );
        }

        while let Some(name) = pending.pop() {
            if layers.contains_key(&name) {
                continue;
            }
            let desc = &unit[&name];
            let deps = desc
                .from
                .iter()
                .cloned()
                .chain(desc.kind.extra_refs())
                .map(|text| DepRef::parse(&text))
                .collect::<Vec<_>>();
            for dep in &deps {
                if desc.kind.reads_last_hidden_state() && dep.scope != DepScope::Base {
                    return Err(RecError::Config(format!(
                        "层`{}`只能读取父网络层的最终隐藏状态，`{}`不是父网络层",
                        name, dep
                    )));
                }
                match dep.scope {
                    DepScope::Same | DepScope::Prev => {
                        if !unit.contains_key(&dep.name) {
                            return Err(RecError::UnknownLayer {
                                layer: name.clone(),
                                reference: dep.to_string(),
                            });
                        }
                        if dep.scope == DepScope::Prev {
                            prev_layers_needed.insert(dep.name.clone());
                        }
                        pending.push(dep.name.clone());
                    }
                    DepScope::Base => {
                        let base = ctx.parent.require(&name, &dep.name)?;
                        if desc.kind.reads_last_hidden_state() {
                            base.hidden_state(&name)?;
                        }
                    }
                    DepScope::Extern => {
                        ctx.data.require(&name, &dep.name)?;
                    }
                    DepScope::StepIndex => {}
                }
            }

            // 选择点在非搜索时做教师强制；带损失的层在评估时需要目标
            let needs_target = (desc.kind.forced_by_target() && !ctx.flags.search_flag)
                || (desc.loss.is_some() && ctx.flags.eval_flag);
            let target = if needs_target {
                let key = desc.target.as_deref().unwrap_or(ctx.default_target);
                ctx.data.require(&name, key)?;
                Some(DepRef::data(key))
            } else {
                None
            };
            if let Some(initial) = &desc.initial_output {
                if let InitialSource::Base(base) = initial.source()? {
                    ctx.parent.require(&name, base)?;
                }
            }

            layers.insert(
                name.clone(),
                LayerTemplate {
                    name: name.clone(),
                    kind: desc.kind.clone(),
                    // 占位，形状推导后覆盖
                    output: DataTemplate::scalar(&name, DType::Float32),
                    deps,
                    target,
                    loss: desc.loss,
                    loss_scale: desc.loss_scale,
                    initial_output: desc.initial_output.clone(),
                },
            );
        }
        Ok((layers, prev_layers_needed))
    }

    /// 深度优先后序遍历；遇到正在访问的结点即为循环依赖
    fn sort(layers: &BTreeMap<String, LayerTemplate>) -> Result<Vec<String>, RecError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            name: &str,
            layers: &BTreeMap<String, LayerTemplate>,
            marks: &mut BTreeMap<String, Mark>,
            stack: &mut Vec<String>,
            order: &mut Vec<String>,
        ) -> Result<(), RecError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| n == name).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(name.to_string());
                    return Err(RecError::CyclicDependency(cycle));
                }
                None => {}
            }
            marks.insert(name.to_string(), Mark::Visiting);
            stack.push(name.to_string());
            for dep in layers[name].same_deps() {
                visit(dep, layers, marks, stack, order)?;
            }
            stack.pop();
            marks.insert(name.to_string(), Mark::Done);
            order.push(name.to_string());
            Ok(())
        }

        let mut roots = vec![TemplateGraph::OUTPUT.to_string()];
        if layers.contains_key(TemplateGraph::END) {
            roots.push(TemplateGraph::END.to_string());
        }
        roots.extend(layers.keys().cloned());

        let mut marks = BTreeMap::new();
        let mut order = Vec::with_capacity(layers.len());
        for root in &roots {
            visit(root, layers, &mut marks, &mut Vec::new(), &mut order)?;
        }
        Ok(order)
    }

    fn infer_templates(
        layers: &mut BTreeMap<String, LayerTemplate>,
        order: &[String],
        ctx: &TemplateContext<'_>,
    ) -> Result<(), RecError> {
        let mut inferred: BTreeMap<String, DataTemplate> = BTreeMap::new();
        loop {
            let mut changed = false;
            for name in order {
                if inferred.contains_key(name) {
                    continue;
                }
                let layer = &layers[name];
                let sources = layer
                    .deps
                    .iter()
                    .map(|dep| match dep.scope {
                        DepScope::Same | DepScope::Prev => Ok(inferred.get(&dep.name).cloned()),
                        _ => external_template(layer, dep, ctx).map(Some),
                    })
                    .collect::<Result<Vec<_>, RecError>>()?;
                let refs = sources.iter().map(Option::as_ref).collect::<Vec<_>>();
                if let Some(template) = layer.kind.out_template(name, &refs)? {
                    inferred.insert(name.clone(), template);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        for name in order {
            let template = inferred.remove(name).ok_or_else(|| {
                RecError::Config(format!(
                    "无法推出层`{}`的输出形状（其输入只有尚未确定的`prev:`自引用？）",
                    name
                ))
            })?;
            if let Some(layer) = layers.get_mut(name) {
                layer.output = template;
            }
        }
        Ok(())
    }

    /// 搜索时：选择点把束宽传给下游（取依赖中第一个非空者，不一致即为配置错误），
    /// 并要求多个选择点在同一步内串成一条链
    fn propagate_beams(
        layers: &mut BTreeMap<String, LayerTemplate>,
        order: &[String],
        flags: NetworkFlags,
    ) -> Result<Vec<String>, RecError> {
        let choices = order
            .iter()
            .filter(|name| layers[name.as_str()].is_choice())
            .cloned()
            .collect::<Vec<_>>();
        if !flags.search_flag {
            return Ok(choices);
        }
        for name in order {
            let layer = &layers[name];
            let beam = match layer.kind.beam_size() {
                Some(beam) => Some(beam),
                None => {
                    let mut beam = None;
                    for dep in layer.same_deps() {
                        match (beam, layers[dep].output.beam_size) {
                            (None, dep_beam) => beam = dep_beam,
                            (Some(a), Some(b)) if a != b => {
                                return Err(RecError::Config(format!(
                                    "层`{}`的输入来自不同束宽（{}与{}）的假设",
                                    name, a, b
                                )));
                            }
                            _ => {}
                        }
                    }
                    beam
                }
            };
            if let Some(layer) = layers.get_mut(name) {
                layer.output.beam_size = beam;
            }
        }
        for pair in choices.windows(2) {
            if !depends_on(layers, &pair[1], &pair[0]) {
                return Err(RecError::Unsupported(format!(
                    "同一步内的选择点`{}`与`{}`互不依赖（并行的选择点）",
                    pair[0], pair[1]
                )));
            }
        }
        Ok(choices)
    }

    /// 各依赖的描述（`prev:`/同一步层取其已推出的输出描述）
    pub(crate) fn dep_templates(
        &self,
        layer: &LayerTemplate,
        ctx: &TemplateContext<'_>,
    ) -> Result<Vec<Option<DataTemplate>>, RecError> {
        layer
            .deps
            .iter()
            .map(|dep| match dep.scope {
                DepScope::Same | DepScope::Prev => {
                    Ok(self.layers.get(&dep.name).map(|l| l.output.clone()))
                }
                _ => external_template(layer, dep, ctx).map(Some),
            })
            .collect()
    }

    pub fn layer(&self, name: &str) -> Option<&LayerTemplate> {
        self.layers.get(name)
    }

    pub(crate) fn get(&self, name: &str) -> Result<&LayerTemplate, RecError> {
        self.layers
            .get(name)
            .ok_or_else(|| RecError::Config(format!("模板图中没有层`{}`", name)))
    }

    pub fn layers(&self) -> impl Iterator<Item = &LayerTemplate> {
        self.layers.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.layers.keys()
    }

    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn prev_layers_needed(&self) -> &BTreeSet<String> {
        &self.prev_layers_needed
    }

    pub fn has_end(&self) -> bool {
        self.layers.contains_key(Self::END)
    }

    pub fn output(&self) -> &LayerTemplate {
        &self.layers[Self::OUTPUT]
    }

    pub fn choices(&self) -> &[String] {
        &self.choices
    }

    /// 跨步传递其输出的层：被`prev:`引用的层与选择点
    pub fn carried_outputs(&self) -> BTreeSet<String> {
        self.prev_layers_needed
            .iter()
            .cloned()
            .chain(self.choices.iter().cloned())
            .collect()
    }

    /// 带附加循环状态的层
    pub fn extra_state_layers(&self) -> impl Iterator<Item = &LayerTemplate> {
        self.layers.values().filter(|l| l.kind.has_recurrent_state())
    }

    /// 被引用的全部外部数据键
    pub fn extern_keys(&self) -> BTreeSet<String> {
        self.layers
            .values()
            .flat_map(|l| l.deps.iter().chain(l.target.iter()))
            .filter(|d| d.scope == DepScope::Extern)
            .map(|d| d.name.clone())
            .collect()
    }

    /// 带损失的层（按名字排序）
    pub fn loss_layers(&self) -> impl Iterator<Item = &LayerTemplate> {
        self.layers.values().filter(|l| l.loss.is_some())
    }
}

/// 同一步内`layer`是否（传递地）依赖`ancestor`
pub(crate) fn depends_on(
    layers: &BTreeMap<String, LayerTemplate>,
    layer: &str,
    ancestor: &str,
) -> bool {
    let mut stack = vec![layer];
    let mut seen = BTreeSet::new();
    while let Some(name) = stack.pop() {
        if !seen.insert(name) {
            continue;
        }
        let Some(template) = layers.get(name) else {
            continue;
        };
        for dep in template.same_deps() {
            if dep == ancestor {
                return true;
            }
            stack.push(dep);
        }
    }
    false
}

/// 父网络层、外部数据帧、步号的描述。
/// 读取最终隐藏状态的层看到的是`[state_size]`的状态而非父网络层的输出
fn external_template(
    layer: &LayerTemplate,
    dep: &DepRef,
    ctx: &TemplateContext<'_>,
) -> Result<DataTemplate, RecError> {
    let reads_hidden_state = layer.kind.reads_last_hidden_state();
    let layer = &layer.name;
    match dep.scope {
        DepScope::Base if reads_hidden_state => {
            let state = ctx.parent.require(layer, &dep.name)?.hidden_state(layer)?;
            Ok(DataTemplate::dense(&dep.name, state.shape()[1..].iter().product()))
        }
        DepScope::Base => Ok(ctx.parent.require(layer, &dep.name)?.template.clone()),
        DepScope::Extern => Ok(ctx.data.require(layer, &dep.name)?.frame_template(&dep.name)),
        DepScope::StepIndex => Ok(DataTemplate::scalar(DepRef::STEP_INDEX, DType::Int32)),
        DepScope::Same | DepScope::Prev => Err(RecError::Config(format!(
            "`{}`不是外部引用",
            dep
        ))),
    }
}
