//! Orchestrator (spec §4.5, §7): wires the device classifier, TP grouper, PP enumerator, ILP
//! balancer and placer into the single `make_plans` entry point, plus the equivalence check
//! and small memoization cache a caller uses to avoid replanning on unchanged device health.

use crate::ctxs::{TrainerCtxs, TrainerStrategyArgs};
use crate::device::DeviceStatusSet;
use crate::error::PlannerError;
use crate::placer::{self, Plan};
use crate::pp_enumerate;
use crate::tp_group;

/// Two device-status snapshots are equivalent when they'd produce the same plan: same
/// used/suspended/unused partition, same straggler/healthy classification per device, and
/// `sr` values within `straggler_safe_gap` of each other (spec §4.5 "Equivalence").
pub fn approx_equal(ctxs: &TrainerCtxs, a: &DeviceStatusSet, b: &DeviceStatusSet) -> bool {
    if a.unused != b.unused {
        return false;
    }

    let a_keys: std::collections::BTreeSet<usize> =
        a.used_sr.keys().chain(a.suspended_sr.keys()).copied().collect();
    let b_keys: std::collections::BTreeSet<usize> =
        b.used_sr.keys().chain(b.suspended_sr.keys()).copied().collect();
    if a_keys != b_keys {
        return false;
    }

    for device_idx in a_keys {
        let sr_a = *a
            .used_sr
            .get(&device_idx)
            .or_else(|| a.suspended_sr.get(&device_idx))
            .expect("device_idx drawn from a's own key set");
        let sr_b = *b
            .used_sr
            .get(&device_idx)
            .or_else(|| b.suspended_sr.get(&device_idx))
            .expect("device_idx present in both key sets by the check above");

        let straggler_a = sr_a >= ctxs.straggler_threshold;
        let straggler_b = sr_b >= ctxs.straggler_threshold;
        if straggler_a != straggler_b {
            return false;
        }
        if (sr_a - sr_b).abs() > ctxs.straggler_safe_gap {
            return false;
        }
    }
    true
}

/// Runs the full pipeline once: device classification, TP grouping, PP template enumeration,
/// per-template Q1/Q2 solves, and top-k selection (spec §4).
pub fn make_plans(
    ctxs: &TrainerCtxs,
    args: TrainerStrategyArgs,
    all_devices_num: usize,
    status: &DeviceStatusSet,
) -> Result<Vec<Plan>, PlannerError> {
    ctxs.validate_for_tp(args.tp)?;

    let arrangement = tp_group::solve_tp_arrangement(ctxs, args.tp, all_devices_num, status)?;

    let mut stragglers: Vec<_> = arrangement
        .tp_groups
        .iter()
        .filter(|g| g.is_straggler())
        .cloned()
        .collect();
    stragglers.sort_by(|a, b| b.sr_effective.partial_cmp(&a.sr_effective).unwrap_or(std::cmp::Ordering::Equal));
    let normal: Vec<_> = arrangement
        .tp_groups
        .iter()
        .filter(|g| !g.is_straggler())
        .cloned()
        .collect();

    let templates = pp_enumerate::enumerate_templates(args.dp, args.pp, &stragglers, normal.len());
    if templates.is_empty() {
        return Err(PlannerError::NoFeasibleTemplate {
            dp: args.dp,
            pp: args.pp,
            tp_groups: arrangement.tp_groups.len(),
        });
    }

    let mut plans = Vec::new();
    for template in &templates {
        if let Some(plan) = placer::build_plan(
            ctxs,
            template,
            &stragglers,
            &normal,
            args.dp,
            args.tp,
            args.pp,
            args.zero,
            &arrangement.new_suspended_devices,
            &arrangement.unused_devices,
        )? {
            plans.push(plan);
        }
    }

    if plans.is_empty() {
        return Err(PlannerError::NoPossibleStrategies);
    }

    Ok(placer::select_top_k(plans, ctxs.top_k))
}

/// Memoizes `make_plans` by device-status equivalence, so a caller polling on a fixed cadence
/// doesn't re-run the search when nothing meaningfully changed.
#[derive(Default)]
pub struct PlannerCache {
    entries: Vec<(TrainerStrategyArgs, DeviceStatusSet, Vec<Plan>)>,
}

impl PlannerCache {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn make_plans(
        &mut self,
        ctxs: &TrainerCtxs,
        args: TrainerStrategyArgs,
        all_devices_num: usize,
        status: &DeviceStatusSet,
    ) -> Result<Vec<Plan>, PlannerError> {
        if let Some((_, _, plans)) = self
            .entries
            .iter()
            .find(|(cached_args, cached_status, _)| *cached_args == args && approx_equal(ctxs, cached_status, status))
        {
            return Ok(plans.clone());
        }

        let plans = make_plans(ctxs, args, all_devices_num, status)?;
        self.entries.push((args, status.clone(), plans.clone()));
        Ok(plans)
    }
}
