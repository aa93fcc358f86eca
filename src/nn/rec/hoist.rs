/*
 * @Author       : 老董
 * @Date         : 2026-02-11
 * @Description  : 移出循环的静态分析：把子网络的层划分为“留在循环内”“循环前”“循环后”三组
 *
 * - 循环后：不被`prev:`引用，且所有同一步的下游层都已在循环后
 * - 循环前：所有同一步的依赖都已在循环前
 * 两种移动交替进行（先后一个、再前一个），直到都无法再移动。
 * `end`、被`prev:`引用的层、带`prev:`依赖的层以及带循环状态的层始终留在循环内。
 */

use std::collections::{BTreeMap, BTreeSet};

use tracing::info;

use super::template::TemplateGraph;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoistPlan {
    in_loop: BTreeSet<String>,
    before: BTreeSet<String>,
    after: BTreeSet<String>,
}

impl HoistPlan {
    /// 不做任何移动
    pub fn all_in_loop(graph: &TemplateGraph) -> Self {
        Self {
            in_loop: graph.names().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn analyze(graph: &TemplateGraph, enabled: bool) -> Self {
        let mut plan = Self::all_in_loop(graph);
        if !enabled {
            return plan;
        }
        let pinned = graph
            .layers()
            .filter(|layer| {
                layer.name == TemplateGraph::END
                    || graph.prev_layers_needed().contains(&layer.name)
                    || layer.prev_deps().next().is_some()
                    || layer.is_recurrent()
            })
            .map(|layer| layer.name.clone())
            .collect::<BTreeSet<_>>();
        let mut dependents: BTreeMap<&str, Vec<&str>> =
            graph.names().map(|n| (n.as_str(), Vec::new())).collect();
        for layer in graph.layers() {
            for dep in layer.same_deps() {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(layer.name.as_str());
                }
            }
        }

        loop {
            let moved_after = plan.move_after(&pinned, &dependents);
            let moved_before = plan.move_before(graph, &pinned);
            if !moved_after && !moved_before {
                break;
            }
        }
        plan
    }

    fn move_after(
        &mut self,
        pinned: &BTreeSet<String>,
        dependents: &BTreeMap<&str, Vec<&str>>,
    ) -> bool {
        let candidate = self
            .in_loop
            .iter()
            .find(|name| {
                !pinned.contains(*name)
                    && dependents
                        .get(name.as_str())
                        .is_none_or(|list| list.iter().all(|d| self.after.contains(*d)))
            })
            .cloned();
        match candidate {
            Some(name) => {
                self.in_loop.remove(&name);
                self.after.insert(name);
                true
            }
            None => false,
        }
    }

    fn move_before(&mut self, graph: &TemplateGraph, pinned: &BTreeSet<String>) -> bool {
        let candidate = self
            .in_loop
            .iter()
            .find(|name| {
                !pinned.contains(*name)
                    && graph
                        .layer(name)
                        .is_some_and(|layer| layer.same_deps().all(|d| self.before.contains(d)))
            })
            .cloned();
        match candidate {
            Some(name) => {
                self.in_loop.remove(&name);
                self.before.insert(name);
                true
            }
            None => false,
        }
    }

    pub fn in_loop(&self) -> &BTreeSet<String> {
        &self.in_loop
    }

    pub fn before(&self) -> &BTreeSet<String> {
        &self.before
    }

    pub fn after(&self) -> &BTreeSet<String> {
        &self.after
    }

    /// 三组恰好覆盖模板图的每一层各一次
    pub fn is_partition_of(&self, graph: &TemplateGraph) -> bool {
        let total = self.in_loop.len() + self.before.len() + self.after.len();
        let placed = |n: &String| {
            self.in_loop.contains(n) || self.before.contains(n) || self.after.contains(n)
        };
        total == graph.names().count() && graph.names().all(placed)
    }

    /// 按拓扑序列出某一组
    pub fn ordered(&self, graph: &TemplateGraph, set: &BTreeSet<String>) -> Vec<String> {
        graph.order().iter().filter(|n| set.contains(*n)).cloned().collect()
    }

    /// 循环前的层中与步号无关者（不直接或间接读取外部逐步数据与步号），只需计算一次
    pub fn step_invariant(&self, graph: &TemplateGraph) -> BTreeSet<String> {
        let mut invariant = BTreeSet::new();
        for name in graph.order() {
            if !self.before.contains(name) {
                continue;
            }
            if let Some(layer) = graph.layer(name) {
                if !layer.reads_step_data() && layer.same_deps().all(|d| invariant.contains(d)) {
                    invariant.insert(name.clone());
                }
            }
        }
        invariant
    }

    pub fn report(&self, layer: &str) {
        info!(
            layer,
            in_loop = self.in_loop.len(),
            before = self.before.len(),
            after = self.after.len(),
            "移到循环之前的层：{}；移到循环之后的层：{}",
            describe(&self.before),
            describe(&self.after)
        );
    }
}

fn describe(set: &BTreeSet<String>) -> String {
    if set.is_empty() {
        "None".to_string()
    } else {
        set.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}
