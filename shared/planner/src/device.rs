//! Device classifier (spec §4.1, first half): straggler-recovery promotion and per-node
//! partitioning of the candidate device pool, ahead of TP-group formation in [`crate::tp_group`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::ctxs::TrainerCtxs;
use crate::error::PlannerError;

/// Devices per node; a node's device ids form the contiguous block
/// `[node_idx * DEVICES_PER_NODE, (node_idx + 1) * DEVICES_PER_NODE)`.
pub const DEVICES_PER_NODE: usize = 8;

/// The three disjoint device-status sets the planner consumes (spec §3, §6).
#[derive(Debug, Clone)]
pub struct DeviceStatusSet {
    pub used_sr: BTreeMap<usize, f64>,
    pub suspended_sr: BTreeMap<usize, f64>,
    pub unused: BTreeSet<usize>,
}

impl DeviceStatusSet {
    /// Checks the three-way disjointness and totality invariant from spec §3.
    pub fn validate(&self, all_devices_num: usize) -> Result<(), PlannerError> {
        let used: BTreeSet<usize> = self.used_sr.keys().copied().collect();
        let suspended: BTreeSet<usize> = self.suspended_sr.keys().copied().collect();

        if let Some(overlap) = used.intersection(&suspended).next() {
            return Err(PlannerError::InvariantViolation(format!(
                "device {overlap} is both used and suspended"
            )));
        }
        if let Some(overlap) = used.intersection(&self.unused).next() {
            return Err(PlannerError::InvariantViolation(format!(
                "device {overlap} is both used and unused"
            )));
        }
        if let Some(overlap) = suspended.intersection(&self.unused).next() {
            return Err(PlannerError::InvariantViolation(format!(
                "device {overlap} is both suspended and unused"
            )));
        }

        let total = used.len() + suspended.len() + self.unused.len();
        if total != all_devices_num {
            return Err(PlannerError::InvariantViolation(format!(
                "used ({}) + suspended ({}) + unused ({}) = {total}, expected {all_devices_num}",
                used.len(),
                suspended.len(),
                self.unused.len(),
            )));
        }
        Ok(())
    }
}

/// A node's available devices (post-promotion), sorted by [`ordering_cmp`]: healthy devices
/// first in id order, stragglers last in ascending sr order.
#[derive(Debug, Clone)]
pub struct NodeDevices {
    pub node_idx: usize,
    /// `(device_id, sr)`, sorted.
    pub ordered: Vec<(usize, f64)>,
}

/// Merges recovered suspended devices (sr dropped below `straggler_threshold`) back into the
/// candidate pool. Returns `(available_sr, still_suspended)`.
pub fn promote(
    ctxs: &TrainerCtxs,
    status: &DeviceStatusSet,
) -> (BTreeMap<usize, f64>, Vec<usize>) {
    let mut available_sr = status.used_sr.clone();
    let mut still_suspended = Vec::new();
    for (&device_idx, &sr) in &status.suspended_sr {
        if sr < ctxs.straggler_threshold {
            available_sr.insert(device_idx, sr);
        } else {
            still_suspended.push(device_idx);
        }
    }
    (available_sr, still_suspended)
}

/// Total order used to sort a node's available devices: healthy devices (`sr < threshold`)
/// sort first by device id ascending; stragglers sort after, by `sr` ascending.
///
/// This replaces the Python reference's single numeric key `sr * DEVICES_PER_NODE` (a
/// large-number trick to push stragglers after healthy devices) with an explicit two-key
/// comparator, per the open question in spec §9.
pub fn ordering_cmp(threshold: f64, a: (usize, f64), b: (usize, f64)) -> Ordering {
    let a_straggler = a.1 >= threshold;
    let b_straggler = b.1 >= threshold;
    match (a_straggler, b_straggler) {
        (false, false) => a.0.cmp(&b.0),
        (true, true) => a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal),
        (false, true) => Ordering::Less,
        (true, false) => Ordering::Greater,
    }
}

/// Partitions the available pool into per-node device lists, validating the all-or-nothing
/// unused rule and the `homo_budget` precondition for every non-fully-unused node.
pub fn partition_nodes(
    ctxs: &TrainerCtxs,
    tp: usize,
    all_devices_num: usize,
    available_sr: &BTreeMap<usize, f64>,
    unused: &BTreeSet<usize>,
) -> Result<Vec<NodeDevices>, PlannerError> {
    let num_nodes = all_devices_num / DEVICES_PER_NODE;
    let homo_budget = DEVICES_PER_NODE.saturating_sub(tp);
    let mut nodes = Vec::new();

    for node_idx in 0..num_nodes {
        let range = node_idx * DEVICES_PER_NODE..(node_idx + 1) * DEVICES_PER_NODE;
        let node_unused_count = range.clone().filter(|d| unused.contains(d)).count();
        if node_unused_count != 0 && node_unused_count != DEVICES_PER_NODE {
            return Err(PlannerError::InvariantViolation(format!(
                "node {node_idx} has {node_unused_count}/{DEVICES_PER_NODE} unused devices; only whole-node unused is supported"
            )));
        }
        if node_unused_count == DEVICES_PER_NODE {
            continue;
        }

        let mut ordered: Vec<(usize, f64)> = range
            .filter_map(|d| available_sr.get(&d).map(|&sr| (d, sr)))
            .collect();

        if ordered.len() <= homo_budget {
            return Err(PlannerError::InvariantViolation(format!(
                "node {node_idx} has only {} available device(s), need more than homo_budget={homo_budget}",
                ordered.len()
            )));
        }

        ordered.sort_by(|&a, &b| ordering_cmp(ctxs.straggler_threshold, a, b));
        nodes.push(NodeDevices { node_idx, ordered });
    }

    Ok(nodes)
}
