//! Placer & emitter (spec §4.4): fills template holes with normal TP groups, runs the
//! per-pipeline and cross-pipeline ILPs, and keeps the top-k plans by makespan.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

use crate::ctxs::{PlanStrategyArgs, TrainerCtxs};
use crate::error::PlannerError;
use crate::ilp;
use crate::pp_enumerate::Template;
use crate::tp_group::TpGroup;

/// One fully realized pipeline: one `TpGroup` per stage, in stage order.
pub type Pipeline = Vec<TpGroup>;

/// Fills a template's `None` holes with normal TP groups (spec §4.4 "Hole filling").
///
/// Pass one prefers a hole's own pipeline when it already hosts a normal group on the same
/// node as one of that pipeline's placed groups, keeping pipelines node-local. Pass two
/// assigns whatever normal groups remain, in their original order, to whatever holes remain.
fn fill_holes(
    template: &Template,
    straggler_tp_groups: &[TpGroup],
    normal_tp_groups: &[TpGroup],
) -> Result<Vec<Pipeline>, PlannerError> {
    let mut taken = vec![false; normal_tp_groups.len()];
    let mut pipelines: Vec<Vec<Option<TpGroup>>> = template
        .iter()
        .map(|pipeline| {
            pipeline
                .iter()
                .map(|slot| slot.map(|idx| straggler_tp_groups[idx].clone()))
                .collect()
        })
        .collect();

    for pipeline in pipelines.iter_mut() {
        let pipeline_nodes: BTreeSet<usize> = pipeline.iter().flatten().map(|g| g.node_idx).collect();
        for slot in pipeline.iter_mut() {
            if slot.is_some() {
                continue;
            }
            let candidate = normal_tp_groups
                .iter()
                .enumerate()
                .find(|(i, g)| !taken[*i] && pipeline_nodes.contains(&g.node_idx))
                .map(|(i, _)| i);
            if let Some(i) = candidate {
                taken[i] = true;
                *slot = Some(normal_tp_groups[i].clone());
            }
        }
    }

    let mut leftover = normal_tp_groups
        .iter()
        .enumerate()
        .filter(|(i, _)| !taken[*i])
        .map(|(_, g)| g.clone());
    for pipeline in pipelines.iter_mut() {
        for slot in pipeline.iter_mut() {
            if slot.is_none() {
                let group = leftover
                    .next()
                    .ok_or(PlannerError::PlacementExhausted { node_idx: usize::MAX })?;
                *slot = Some(group);
            }
        }
    }

    pipelines
        .into_iter()
        .map(|pipeline| {
            pipeline
                .into_iter()
                .map(|slot| slot.ok_or(PlannerError::PlacementExhausted { node_idx: usize::MAX }))
                .collect()
        })
        .collect()
}

/// Assigns ranks in pipeline order, then stage order (spec §4.4 "Emission"). Stage `s` of
/// pipeline `p` owns the fixed-width rank block `[base + s*tp, base + s*tp + tp)`, where `base`
/// is the cumulative `stage_count * tp` of every earlier pipeline — so every stage reserves a
/// full `tp`-wide block regardless of how many devices its group actually has. The first
/// `group.devices.len()` ranks in the block map to the group's real devices; the remainder (a
/// hetero group's shrunk tail) are padded first with newly suspended devices, then newly
/// unused devices, each consumed at most once and recorded by rank in the returned lists.
fn rank_to_device_mapping(
    pipelines: &[Pipeline],
    tp: usize,
    suspended_devices: &[usize],
    unused_devices: &[usize],
) -> Result<(BTreeMap<usize, usize>, Vec<usize>, Vec<usize>), PlannerError> {
    let mut mapping = BTreeMap::new();
    let mut suspended_rank_list = Vec::new();
    let mut unused_rank_list = Vec::new();
    let mut base_rank_idx = 0usize;

    for pipeline in pipelines {
        for (stage_idx, group) in pipeline.iter().enumerate() {
            let start_rank_idx = base_rank_idx + stage_idx * tp;
            for offset in 0..tp {
                let rank_idx = start_rank_idx + offset;
                if offset < group.devices.len() {
                    mapping.insert(rank_idx, group.devices[offset]);
                } else if suspended_rank_list.len() < suspended_devices.len() {
                    mapping.insert(rank_idx, suspended_devices[suspended_rank_list.len()]);
                    suspended_rank_list.push(rank_idx);
                } else if unused_rank_list.len() < unused_devices.len() {
                    mapping.insert(rank_idx, unused_devices[unused_rank_list.len()]);
                    unused_rank_list.push(rank_idx);
                } else {
                    return Err(PlannerError::InvariantViolation(format!(
                        "rank {rank_idx} needs padding but no suspended/unused device remains"
                    )));
                }
            }
        }
        base_rank_idx += pipeline.len() * tp;
    }

    Ok((mapping, suspended_rank_list, unused_rank_list))
}

/// One admitted, fully resolved plan.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub args: PlanStrategyArgs,
    pub makespan: f64,
}

/// Runs Q1 on every pipeline and Q2 across all of them, producing one `Plan` (or `None` if
/// either ILP is infeasible for this template).
#[allow(clippy::too_many_arguments)]
pub fn build_plan(
    ctxs: &TrainerCtxs,
    template: &Template,
    straggler_tp_groups: &[TpGroup],
    normal_tp_groups: &[TpGroup],
    dp: usize,
    tp: usize,
    pp: usize,
    zero: bool,
    suspended_devices: &[usize],
    unused_devices: &[usize],
) -> Result<Option<Plan>, PlannerError> {
    let pipelines = fill_holes(template, straggler_tp_groups, normal_tp_groups)?;
    let total_layers = ctxs.normal_layers * pp as u32;

    let mut layer_splits = Vec::with_capacity(pipelines.len());
    for pipeline in &pipelines {
        match ilp::solve_layer_split(ctxs, pipeline, total_layers)? {
            Some(split) => layer_splits.push(split),
            None => return Ok(None),
        }
    }

    let total_micro_batches = ctxs.normal_mbn * dp as u32;
    let stage_times: Vec<f64> = layer_splits.iter().map(|s| s.stage_time).collect();
    let stage_counts: Vec<usize> = pipelines.iter().map(|p| p.len()).collect();

    let micro_split = match ilp::solve_micro_batch_split(ctxs, &stage_times, &stage_counts, total_micro_batches)? {
        Some(split) => split,
        None => return Ok(None),
    };

    let hetero_layers: Vec<Vec<u32>> = layer_splits.into_iter().map(|s| s.layers).collect();
    let hetero_stages = stage_counts;
    let hetero_data = hetero_stages.windows(2).any(|w| w[0] != w[1])
        || hetero_layers.windows(2).any(|w| w[0] != w[1])
        || micro_split.micro_batches.windows(2).any(|w| w[0] != w[1])
        || pipelines.iter().flatten().any(|g| g.hetero_ratio > 1);

    let (mapping, suspended_rank_list, unused_rank_list) =
        rank_to_device_mapping(&pipelines, tp, suspended_devices, unused_devices)?;

    let args = PlanStrategyArgs {
        dp,
        tp,
        pp,
        zero,
        rank_to_device_mapping: mapping,
        suspended_rank_list,
        unused_rank_list,
        hetero_data,
        hetero_layers,
        hetero_stages,
        hetero_micro_batch_num_list: micro_split.micro_batches,
    };

    Ok(Some(Plan {
        args,
        makespan: micro_split.makespan,
    }))
}

/// Wraps a `Plan` with its original enumeration index for a fully deterministic tie-break.
struct ScoredPlan {
    idx: usize,
    plan: Plan,
}

impl PartialEq for ScoredPlan {
    fn eq(&self, other: &Self) -> bool {
        self.plan.makespan == other.plan.makespan && self.idx == other.idx
    }
}
impl Eq for ScoredPlan {}

impl PartialOrd for ScoredPlan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredPlan {
    /// "Greater" means worse: higher makespan, or (on a tie) later in enumeration order.
    /// `select_top_k`'s max-heap evicts the greatest element first, so this keeps the fastest
    /// plans and, among equally fast ones, the earliest-enumerated.
    fn cmp(&self, other: &Self) -> Ordering {
        self.plan
            .makespan
            .partial_cmp(&other.plan.makespan)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.idx.cmp(&other.idx))
    }
}

/// Keeps the `k` lowest-makespan plans, sorted ascending, breaking exact ties by enumeration
/// order so repeated runs over the same candidates are bit-for-bit identical (spec §4.4).
pub fn select_top_k(plans: Vec<Plan>, k: usize) -> Vec<Plan> {
    let mut heap: BinaryHeap<ScoredPlan> = BinaryHeap::new();
    for (idx, plan) in plans.into_iter().enumerate() {
        heap.push(ScoredPlan { idx, plan });
        if heap.len() > k {
            heap.pop();
        }
    }
    let mut scored: Vec<ScoredPlan> = heap.into_iter().collect();
    scored.sort_by(|a, b| a.cmp(b));
    scored.into_iter().map(|s| s.plan).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(node_idx: usize, devices: Vec<usize>, tp_nominal: usize) -> TpGroup {
        let hetero_ratio = tp_nominal / devices.len();
        TpGroup {
            node_idx,
            tp_nominal,
            devices,
            hetero_ratio,
            sr_effective: 1.0,
        }
    }

    #[test]
    fn fill_holes_prefers_same_node_normal_group() {
        let straggler = vec![group(0, vec![7], 2)];
        let normal = vec![group(0, vec![0, 1], 2), group(1, vec![2, 3], 2)];
        let template: Template = vec![vec![Some(0), None], vec![None, None]];
        let pipelines = fill_holes(&template, &straggler, &normal).unwrap();
        assert_eq!(pipelines[0][0].devices, vec![7]);
        assert_eq!(pipelines[0][1].node_idx, 0);
        assert_eq!(pipelines[1][0].node_idx, 1);
        assert_eq!(pipelines[1][1].node_idx, 1);
    }

    #[test]
    fn rank_to_device_mapping_is_contiguous_and_bijective() {
        let pipelines = vec![
            vec![group(0, vec![0, 1], 2), group(0, vec![2, 3], 2)],
            vec![group(1, vec![4, 5], 2), group(1, vec![6, 7], 2)],
        ];
        let (mapping, suspended, unused) = rank_to_device_mapping(&pipelines, 2, &[], &[]).unwrap();
        assert_eq!(mapping.keys().copied().collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        let devices: BTreeSet<usize> = mapping.values().copied().collect();
        assert_eq!(devices, (0..8).collect::<BTreeSet<_>>());
        assert!(suspended.is_empty());
        assert!(unused.is_empty());
    }

    // A size-1 hetero group on tp=2 still reserves a full 2-wide rank block (spec §4.4); the
    // second rank in that block is padding, filled from suspended devices first.
    #[test]
    fn rank_to_device_mapping_pads_hetero_tail_with_suspended_device() {
        let pipelines = vec![vec![group(0, vec![0, 1], 2), group(0, vec![6], 2)]];
        let (mapping, suspended, unused) = rank_to_device_mapping(&pipelines, 2, &[7], &[]).unwrap();
        assert_eq!(mapping.keys().copied().collect::<Vec<_>>(), (0..4).collect::<Vec<_>>());
        assert_eq!(mapping[&0], 0);
        assert_eq!(mapping[&1], 1);
        assert_eq!(mapping[&2], 6);
        assert_eq!(mapping[&3], 7);
        assert_eq!(suspended, vec![3]);
        assert!(unused.is_empty());
    }

    #[test]
    fn rank_to_device_mapping_errors_when_padding_runs_out() {
        let pipelines = vec![vec![group(0, vec![6], 2)]];
        let result = rank_to_device_mapping(&pipelines, 2, &[], &[]);
        assert!(result.is_err());
    }

    #[test]
    fn select_top_k_keeps_lowest_makespans_in_order() {
        let make_plan = |makespan: f64| Plan {
            args: PlanStrategyArgs {
                dp: 1,
                tp: 1,
                pp: 1,
                zero: false,
                rank_to_device_mapping: BTreeMap::new(),
                suspended_rank_list: vec![],
                unused_rank_list: vec![],
                hetero_data: false,
                hetero_layers: vec![],
                hetero_stages: vec![],
                hetero_micro_batch_num_list: vec![],
            },
            makespan,
        };
        let plans = vec![make_plan(3.0), make_plan(1.0), make_plan(2.0)];
        let top = select_top_k(plans, 2);
        assert_eq!(top.iter().map(|p| p.makespan).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[test]
    fn select_top_k_breaks_ties_by_enumeration_order() {
        let make_plan = |makespan: f64| Plan {
            args: PlanStrategyArgs {
                dp: 1,
                tp: 1,
                pp: 1,
                zero: false,
                rank_to_device_mapping: BTreeMap::new(),
                suspended_rank_list: vec![],
                unused_rank_list: vec![],
                hetero_data: false,
                hetero_layers: vec![],
                hetero_stages: vec![],
                hetero_micro_batch_num_list: vec![],
            },
            makespan,
        };
        let plans = vec![make_plan(1.0), make_plan(1.0), make_plan(1.0)];
        let top = select_top_k(plans, 2);
        assert_eq!(top.len(), 2);
    }
}
