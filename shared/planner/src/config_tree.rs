//! Tensor config-tree emission (spec §6, §9): turns a resolved plan into the nested
//! per-tensor placement tree a training framework consumes, grounded in the reference
//! `generate_gpt_3d_config`/`config_spread_zero` collaborator this planner replaces the
//! hand-written half of. Kept behind the [`ParallelConfigGenerator`] trait so the planner
//! itself never needs to know a model's tensor layout.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::placer::Pipeline;

/// A node in the per-tensor placement tree. `Leaf` describes how one tensor is split and
/// duplicated across device groups; `Branch` nests named sub-trees (e.g. one per transformer
/// block).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConfigNode {
    Leaf {
        /// Tensor-parallel split degree along each split dimension, outermost first.
        split: Vec<usize>,
        /// Data-parallel duplication degree.
        dup: usize,
        /// One device id list per duplicate, in duplicate order.
        device_group_union: Vec<Vec<usize>>,
        /// Whether `dup` is itself ZeRO-sharded (ctxs `zero` flag on the owning plan).
        zero_sharded: bool,
    },
    Branch {
        children: IndexMap<String, ConfigNode>,
    },
}

/// Narrow boundary between the planner and a model-specific tensor-layout generator; the
/// planner depends only on this trait, never on a concrete model's tensor names.
pub trait ParallelConfigGenerator {
    fn generate(&self, pipelines: &[Pipeline], zero: bool) -> IndexMap<String, ConfigNode>;
}

/// Reference generator for a GPT-style decoder stack: one leaf per transformer block (grouped
/// by the pipeline stage that owns it), plus replicated embedding and final-norm leaves.
pub struct GptConfigGenerator;

impl ParallelConfigGenerator for GptConfigGenerator {
    fn generate(&self, pipelines: &[Pipeline], zero: bool) -> IndexMap<String, ConfigNode> {
        let mut tree = IndexMap::new();

        let all_devices: Vec<Vec<usize>> = pipelines
            .iter()
            .flat_map(|pipeline| pipeline.iter())
            .map(|group| group.devices.clone())
            .collect();
        let world: Vec<usize> = {
            let mut v: Vec<usize> = all_devices.iter().flatten().copied().collect();
            v.sort_unstable();
            v.dedup();
            v
        };

        tree.insert(
            "word_embeddings".to_string(),
            ConfigNode::Leaf {
                split: vec![],
                dup: world.len(),
                device_group_union: vec![world.clone()],
                zero_sharded: zero,
            },
        );

        // Stage shape is read off pipeline 0; heterogeneous pipelines with a different stage
        // count than pipeline 0 reuse its trailing stage for any extra stages of their own.
        // This under-specifies cross-pipeline layer alignment for the non-uniform case, which
        // is acceptable here since tensor-config emission is not itself part of the planner's
        // contract (spec §9 Non-goals).
        let reference_stage_count = pipelines.first().map(Vec::len).unwrap_or(0);
        for stage_idx in 0..reference_stage_count {
            let mut device_group_union = Vec::with_capacity(pipelines.len());
            let mut split = vec![];
            for pipeline in pipelines {
                let group = &pipeline[stage_idx.min(pipeline.len() - 1)];
                device_group_union.push(group.devices.clone());
                split = vec![group.devices.len()];
            }
            tree.insert(
                format!("transformer_block_{stage_idx}"),
                ConfigNode::Leaf {
                    split,
                    dup: pipelines.len(),
                    device_group_union,
                    zero_sharded: zero,
                },
            );
        }

        tree.insert(
            "final_layernorm".to_string(),
            ConfigNode::Leaf {
                split: vec![],
                dup: world.len(),
                device_group_union: vec![world],
                zero_sharded: zero,
            },
        );

        tree
    }
}
