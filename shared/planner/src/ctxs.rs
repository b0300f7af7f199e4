//! Configuration and argument types consumed/produced at the planner boundary (spec §6).
//!
//! `TrainerCtxs` and `TrainerStrategyArgs` are the planner's only inputs besides the live
//! device-status triple; both round-trip through `serde` so an embedding application can
//! persist or transmit them, mirroring `ExternalModelConfig` in the teacher coordinator crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::PlannerError;

fn default_straggler_threshold() -> f64 {
    1.2
}

fn default_straggler_safe_gap() -> f64 {
    0.05
}

fn default_top_k() -> usize {
    3
}

fn default_ilp_time_limit_secs() -> u32 {
    5
}

/// Immutable planner constants, supplied once per run and reused across `StrategyModel`
/// instances as device health changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerCtxs {
    /// Per-hetero-level slowdown penalty, indexed by `log2(hetero_ratio)`. `alpha[0]` is the
    /// homogeneous-group penalty and must be `1.0`.
    pub hetero_tp_alpha: Vec<f64>,
    /// Per-hetero-level throughput weight used when scoring candidate hetero splits, indexed
    /// the same way as `hetero_tp_alpha`.
    pub hetero_tp_weight: Vec<f64>,
    /// `sr` at or above this value is a straggler; below it, rounds to `1.0`.
    #[serde(default = "default_straggler_threshold")]
    pub straggler_threshold: f64,
    /// Tolerance used by [`crate::model::approx_equal`] when comparing two `StrategyModel`s.
    #[serde(default = "default_straggler_safe_gap")]
    pub straggler_safe_gap: f64,
    /// Raw per-device memory budget in the same units as `memory_k`/`memory_embedding`.
    pub memory_bound: f64,
    /// Subtracted from `memory_bound` to leave headroom; `C = memory_bound - memory_safe_gap`.
    #[serde(default)]
    pub memory_safe_gap: f64,
    /// Per-stage memory coefficient, indexed from the tail of the pipeline (`k[-(S-j)]`).
    pub memory_k: Vec<f64>,
    /// Extra memory charged only on the first and last stage of a pipeline (embedding tables).
    #[serde(default)]
    pub memory_embedding: f64,
    /// Fixed per-stage memory overhead independent of layer count.
    #[serde(default)]
    pub memory_extra: f64,
    /// Transformer layers per pipeline stage at the baseline (non-hetero) `PP`; `L = PP * normal_layers`.
    pub normal_layers: u32,
    /// Baseline micro-batches per pipeline; `B/b = DP * normal_mbn`.
    pub normal_mbn: u32,
    /// Number of top-scoring plans to return.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Deterministic wall-clock cutoff handed to the CBC backend for each Q1/Q2 solve.
    #[serde(default = "default_ilp_time_limit_secs")]
    pub ilp_time_limit_secs: u32,
}

impl TrainerCtxs {
    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Deserialize from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Validates the cross-field invariants a given baseline `tp` imposes on the hetero
    /// penalty/weight vectors: both must have one entry per hetero level `0..=log2(tp)`.
    pub fn validate_for_tp(&self, tp: usize) -> Result<(), PlannerError> {
        let levels = tp.trailing_zeros() as usize + 1;
        if !tp.is_power_of_two() {
            return Err(PlannerError::InvalidConfig(format!(
                "tp={tp} must be a power of two"
            )));
        }
        if self.hetero_tp_alpha.len() != levels {
            return Err(PlannerError::InvalidConfig(format!(
                "hetero_tp_alpha has {} entries, expected {levels} for tp={tp}",
                self.hetero_tp_alpha.len()
            )));
        }
        if self.hetero_tp_weight.len() != levels {
            return Err(PlannerError::InvalidConfig(format!(
                "hetero_tp_weight has {} entries, expected {levels} for tp={tp}",
                self.hetero_tp_weight.len()
            )));
        }
        if self.hetero_tp_alpha[0] != 1.0 {
            return Err(PlannerError::InvalidConfig(
                "hetero_tp_alpha[0] (homogeneous groups) must be 1.0".to_string(),
            ));
        }
        if self.memory_k.is_empty() {
            return Err(PlannerError::InvalidConfig(
                "memory_k must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// The baseline 3D-parallel configuration a `StrategyModel` is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainerStrategyArgs {
    pub dp: usize,
    pub tp: usize,
    pub pp: usize,
    pub zero: bool,
}

/// A single emitted plan's strategy arguments (spec §6, "Produced").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStrategyArgs {
    pub dp: usize,
    pub tp: usize,
    pub pp: usize,
    pub zero: bool,
    pub rank_to_device_mapping: BTreeMap<usize, usize>,
    pub suspended_rank_list: Vec<usize>,
    pub unused_rank_list: Vec<usize>,
    pub hetero_data: bool,
    pub hetero_layers: Vec<Vec<u32>>,
    pub hetero_stages: Vec<usize>,
    pub hetero_micro_batch_num_list: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctxs_json_round_trips() {
        let ctxs = TrainerCtxs {
            hetero_tp_alpha: vec![1.0, 1.3],
            hetero_tp_weight: vec![1.0, 1.0],
            straggler_threshold: 1.2,
            straggler_safe_gap: 0.05,
            memory_bound: 100.0,
            memory_safe_gap: 0.0,
            memory_k: vec![1.0],
            memory_embedding: 0.0,
            memory_extra: 0.0,
            normal_layers: 8,
            normal_mbn: 4,
            top_k: 3,
            ilp_time_limit_secs: 5,
        };
        let json = ctxs.to_json().unwrap();
        assert_eq!(TrainerCtxs::from_json(&json).unwrap(), ctxs);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let json = r#"{
            "hetero_tp_alpha": [1.0],
            "hetero_tp_weight": [1.0],
            "memory_bound": 100.0,
            "memory_k": [1.0],
            "normal_layers": 8,
            "normal_mbn": 4
        }"#;
        let ctxs = TrainerCtxs::from_json(json).unwrap();
        assert_eq!(ctxs.straggler_threshold, default_straggler_threshold());
        assert_eq!(ctxs.top_k, default_top_k());
    }
}
