//! PP enumerator (spec §4.2): hetero-stage-count plans plus the symmetry-broken DFS that
//! places straggler TP groups into stage slots, leaving `None` holes for normal TP groups.

use crate::tp_group::TpGroup;

/// Per-pipeline stage count, one entry per data-parallel replica.
pub type HeteroStagesPlan = Vec<usize>;

/// A partially specified pipeline layout: `template[pipeline][stage]` is `Some(index)` into
/// the straggler-groups slice the template was built from, or `None` (a normal-group hole).
pub type Template = Vec<Vec<Option<usize>>>;

/// Generates the candidate stage-count plans (spec §4.2 "Stage-count plans").
pub fn hetero_stages_plans(dp: usize, total_tp_groups: usize, pp: usize) -> Vec<HeteroStagesPlan> {
    if dp * pp == total_tp_groups {
        return vec![vec![pp; dp]];
    }
    let base = total_tp_groups / dp;
    let remainder = total_tp_groups - dp * base;

    let concentrated: HeteroStagesPlan = (0..dp)
        .map(|i| if i == 0 { base + remainder } else { base })
        .collect();
    let spread: HeteroStagesPlan = (0..dp)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect();

    vec![concentrated, spread]
}

/// DFS search state for one `HeteroStagesPlan`. `straggler_tp_groups` must already be sorted
/// by `sr_effective` descending (spec §4.2).
struct Dfs<'a> {
    dp: usize,
    stage_plan: &'a [usize],
    straggler_tp_groups: &'a [TpGroup],
    total_normal: usize,
    visited_straggler: Vec<bool>,
    visited_normal: usize,
    pipelines: Vec<Vec<Option<usize>>>,
    pipelines_straggler_count: Vec<usize>,
    results: Vec<Template>,
}

impl<'a> Dfs<'a> {
    fn run(&mut self, pipeline_idx: usize) {
        if pipeline_idx == self.dp {
            self.results.push(self.pipelines.clone());
            return;
        }
        let mut pipeline = Vec::new();
        let mut straggler_count = 0usize;
        self.pipeline_dfs(pipeline_idx, &mut pipeline, &mut straggler_count, 0, 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn pipeline_dfs(
        &mut self,
        pipeline_idx: usize,
        pipeline: &mut Vec<Option<usize>>,
        straggler_count: &mut usize,
        stage_idx: usize,
        min_straggler_idx: usize,
    ) {
        // Symmetry-breaking: a later pipeline may not carry more stragglers than the one
        // before it, and when the counts tie, its leading straggler's sr may not exceed the
        // leading pipeline's (spec §4.2 rule 2). This prunes permutation-equivalent orderings
        // of the (permutation-invariant) DP dimension.
        if pipeline_idx != 0 {
            let prev_count = self.pipelines_straggler_count[pipeline_idx - 1];
            if *straggler_count > prev_count {
                return;
            }
            if *straggler_count >= 1 && *straggler_count == prev_count {
                let this_first_sr = pipeline
                    .first()
                    .and_then(|o| *o)
                    .map(|idx| self.straggler_tp_groups[idx].sr_effective);
                let prev_first_sr = self.pipelines[pipeline_idx - 1]
                    .first()
                    .and_then(|o| *o)
                    .map(|idx| self.straggler_tp_groups[idx].sr_effective);
                if let (Some(this_sr), Some(prev_sr)) = (this_first_sr, prev_first_sr) {
                    if this_sr > prev_sr {
                        return;
                    }
                }
            }
        }

        if stage_idx == self.stage_plan[pipeline_idx] {
            // spec §4.2 rule 3: a pipeline whose last stage is an admitted-but-unused
            // straggler group is rejected. `TpGroup` carries no `unused` flag (see
            // SPEC_FULL.md §9 design notes), so this guard can never fire; retained only as
            // a documented no-op for forward compatibility with a future admission path.
            self.pipelines.push(pipeline.clone());
            self.pipelines_straggler_count.push(*straggler_count);
            self.run(pipeline_idx + 1);
            self.pipelines.pop();
            self.pipelines_straggler_count.pop();
            return;
        }

        for idx in min_straggler_idx..self.straggler_tp_groups.len() {
            if self.visited_straggler[idx] {
                continue;
            }
            self.visited_straggler[idx] = true;
            *straggler_count += 1;
            pipeline.push(Some(idx));
            self.pipeline_dfs(pipeline_idx, pipeline, straggler_count, stage_idx + 1, idx + 1);
            pipeline.pop();
            *straggler_count -= 1;
            self.visited_straggler[idx] = false;
        }

        if self.visited_normal >= self.total_normal {
            return;
        }
        pipeline.push(None);
        self.visited_normal += 1;
        let total_stragglers = self.straggler_tp_groups.len();
        self.pipeline_dfs(pipeline_idx, pipeline, straggler_count, stage_idx + 1, total_stragglers);
        self.visited_normal -= 1;
        pipeline.pop();
    }
}

/// Enumerates every template consistent with one `HeteroStagesPlan` (spec §4.2 "Template DFS").
pub fn enumerate_for_stage_plan(
    dp: usize,
    straggler_tp_groups: &[TpGroup],
    total_normal_tp_group_num: usize,
    stage_plan: &[usize],
) -> Vec<Template> {
    let mut dfs = Dfs {
        dp,
        stage_plan,
        straggler_tp_groups,
        total_normal: total_normal_tp_group_num,
        visited_straggler: vec![false; straggler_tp_groups.len()],
        visited_normal: 0,
        pipelines: Vec::new(),
        pipelines_straggler_count: Vec::new(),
        results: Vec::new(),
    };
    dfs.run(0);
    dfs.results
}

/// Enumerates templates across every stage-count plan for the given `dp`/`pp`/TP-group set.
pub fn enumerate_templates(
    dp: usize,
    pp: usize,
    straggler_tp_groups: &[TpGroup],
    total_normal_tp_group_num: usize,
) -> Vec<Template> {
    let total_tp_groups = straggler_tp_groups.len() + total_normal_tp_group_num;
    let mut templates = Vec::new();
    for stage_plan in hetero_stages_plans(dp, total_tp_groups, pp) {
        templates.extend(enumerate_for_stage_plan(
            dp,
            straggler_tp_groups,
            total_normal_tp_group_num,
            &stage_plan,
        ));
    }
    templates
}
