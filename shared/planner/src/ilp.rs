//! ILP balancer (spec §4.3): the two integer programs solved per candidate template, backed
//! by `good_lp`'s CBC binding (mirroring the Python reference's `pulp` usage).

use good_lp::{constraint, coin_cbc, variable, Expression, ProblemVariables, Solution, SolverModel};
use tracing::warn;

use crate::ctxs::TrainerCtxs;
use crate::error::PlannerError;
use crate::tp_group::TpGroup;

/// Q1 result for a single pipeline: layers assigned to each stage and the resulting
/// per-microbatch stage time (the pipeline's throughput bottleneck).
#[derive(Debug, Clone, PartialEq)]
pub struct LayerSplit {
    pub layers: Vec<u32>,
    pub stage_time: f64,
}

fn memory_coefficient(ctxs: &TrainerCtxs, stage_idx: usize, stage_count: usize) -> f64 {
    let k_len = ctxs.memory_k.len() as isize;
    let from_tail = k_len - (stage_count as isize - stage_idx as isize);
    let idx = from_tail.max(0) as usize;
    ctxs.memory_k[idx.min(ctxs.memory_k.len() - 1)]
}

/// Solves Q1 (spec §4.3): split `total_layers` transformer layers across `stage_groups`'
/// stages to minimize the slowest stage's per-microbatch time, subject to each stage's
/// per-device memory footprint staying under `memory_bound - memory_safe_gap`.
///
/// Returns `Ok(None)` when the memory constraints make every split infeasible.
pub fn solve_layer_split(
    ctxs: &TrainerCtxs,
    stage_groups: &[TpGroup],
    total_layers: u32,
) -> Result<Option<LayerSplit>, PlannerError> {
    let stage_count = stage_groups.len();
    let mut vars = ProblemVariables::new();
    let time_var = vars.add(variable().min(0.0));
    let layer_vars: Vec<_> = (0..stage_count)
        .map(|_| vars.add(variable().integer().min(1.0)))
        .collect();

    let mut problem = vars.minimise(time_var).using(coin_cbc);
    problem.set_parameter("seconds", &ctxs.ilp_time_limit_secs.to_string());

    let mut total_expr = Expression::from(0.0);
    for (j, group) in stage_groups.iter().enumerate() {
        let time_coef = group.hetero_ratio as f64 * group.sr_effective;
        problem = problem.with(constraint!(time_var >= time_coef * layer_vars[j]));

        let k = memory_coefficient(ctxs, j, stage_count);
        let embedding = if j == 0 || j == stage_count - 1 {
            ctxs.memory_embedding
        } else {
            0.0
        };
        let ratio = group.hetero_ratio as f64;
        let budget = ctxs.memory_bound - ctxs.memory_safe_gap;
        problem = problem.with(constraint!(
            ratio * (k * layer_vars[j] + embedding) + ctxs.memory_extra <= budget
        ));

        total_expr += layer_vars[j];
    }
    problem = problem.with(constraint!(total_expr == total_layers as f64));

    match problem.solve() {
        Ok(solution) => {
            let layers = layer_vars
                .iter()
                .map(|&v| solution.value(v).round() as u32)
                .collect();
            Ok(Some(LayerSplit {
                layers,
                stage_time: solution.value(time_var),
            }))
        }
        Err(good_lp::ResolutionError::Infeasible) => Ok(None),
        Err(err) => {
            warn!(error = %err, "q1 ilp solve failed");
            Err(PlannerError::Solver(err.to_string()))
        }
    }
}

/// Q2 result: micro-batches assigned to each pipeline and the resulting end-to-end makespan.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroBatchSplit {
    pub micro_batches: Vec<u32>,
    pub makespan: f64,
}

/// Solves Q2 (spec §4.3): split `total_micro_batches` across pipelines whose per-microbatch
/// stage time and stage count are already known, to minimize the slowest pipeline's
/// `U >= T_i * m_i` bound, subject to each pipeline carrying at least one micro-batch per
/// stage (`m_i >= stages_i`).
pub fn solve_micro_batch_split(
    ctxs: &TrainerCtxs,
    pipeline_stage_times: &[f64],
    pipeline_stage_counts: &[usize],
    total_micro_batches: u32,
) -> Result<Option<MicroBatchSplit>, PlannerError> {
    let dp = pipeline_stage_times.len();
    let mut vars = ProblemVariables::new();
    let time_var = vars.add(variable().min(0.0));
    let mb_vars: Vec<_> = (0..dp)
        .map(|_| vars.add(variable().integer().min(1.0)))
        .collect();

    let mut problem = vars.minimise(time_var).using(coin_cbc);
    problem.set_parameter("seconds", &ctxs.ilp_time_limit_secs.to_string());

    let mut total_expr = Expression::from(0.0);
    for i in 0..dp {
        let stage_time = pipeline_stage_times[i];
        problem = problem.with(constraint!(time_var >= stage_time * mb_vars[i]));
        problem = problem.with(constraint!(mb_vars[i] >= pipeline_stage_counts[i] as f64));
        total_expr += mb_vars[i];
    }
    problem = problem.with(constraint!(total_expr == total_micro_batches as f64));

    match problem.solve() {
        Ok(solution) => {
            let micro_batches = mb_vars
                .iter()
                .map(|&v| solution.value(v).round() as u32)
                .collect();
            Ok(Some(MicroBatchSplit {
                micro_batches,
                makespan: solution.value(time_var),
            }))
        }
        Err(good_lp::ResolutionError::Infeasible) => Ok(None),
        Err(err) => {
            warn!(error = %err, "q2 ilp solve failed");
            Err(PlannerError::Solver(err.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctxs() -> TrainerCtxs {
        TrainerCtxs {
            hetero_tp_alpha: vec![1.0, 1.3],
            hetero_tp_weight: vec![1.0, 1.0],
            straggler_threshold: 1.2,
            straggler_safe_gap: 0.05,
            memory_bound: 1000.0,
            memory_safe_gap: 0.0,
            memory_k: vec![1.0],
            memory_embedding: 0.0,
            memory_extra: 0.0,
            normal_layers: 8,
            normal_mbn: 4,
            top_k: 3,
            ilp_time_limit_secs: 5,
        }
    }

    fn homo_group(node_idx: usize) -> TpGroup {
        TpGroup {
            node_idx,
            tp_nominal: 2,
            devices: vec![0, 1],
            hetero_ratio: 1,
            sr_effective: 1.0,
        }
    }

    #[test]
    fn q1_splits_layers_evenly_between_equal_stages() {
        let ctxs = ctxs();
        let stages = vec![homo_group(0), homo_group(1)];
        let result = solve_layer_split(&ctxs, &stages, 4).unwrap().unwrap();
        assert_eq!(result.layers.iter().sum::<u32>(), 4);
        assert!(result.layers.iter().all(|&l| l == 2));
    }

    #[test]
    fn q1_infeasible_when_memory_too_tight() {
        let mut ctxs = ctxs();
        ctxs.memory_bound = 0.5;
        let stages = vec![homo_group(0), homo_group(1)];
        let result = solve_layer_split(&ctxs, &stages, 4).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn q2_splits_micro_batches_evenly_between_equal_pipelines() {
        let ctxs = ctxs();
        let result = solve_micro_batch_split(&ctxs, &[1.0, 1.0], &[2, 2], 4)
            .unwrap()
            .unwrap();
        assert_eq!(result.micro_batches.iter().sum::<u32>(), 4);
        assert!(result.micro_batches.iter().all(|&m| m == 2));
    }

    #[test]
    fn q2_gives_fewer_micro_batches_to_the_slower_pipeline() {
        let ctxs = ctxs();
        let result = solve_micro_batch_split(&ctxs, &[1.0, 2.0], &[2, 2], 6)
            .unwrap()
            .unwrap();
        assert!(result.micro_batches[1] < result.micro_batches[0]);
    }
}
