//! Fault snapshot consumed once per scheduling cycle.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use api_types::ReschedulerState;

use crate::allocator::AllocationRecord;

/// Immutable view of the rescheduler's fault state for one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultSnapshot {
    degraded_nodes: HashSet<String>,
    evicted_nodes: HashSet<String>,
    faulted_devices: BTreeMap<String, BTreeSet<usize>>,
    rescheduling_jobs: HashSet<String>,
}

impl From<ReschedulerState> for FaultSnapshot {
    fn from(state: ReschedulerState) -> Self {
        Self {
            degraded_nodes: state.degraded_nodes.into_iter().collect(),
            evicted_nodes: state.evicted_nodes.into_iter().collect(),
            faulted_devices: state
                .faulted_devices
                .into_iter()
                .map(|(node, devices)| (node, devices.into_iter().collect()))
                .collect(),
            rescheduling_jobs: state.rescheduling_jobs.into_iter().collect(),
        }
    }
}

impl FaultSnapshot {
    pub fn is_degraded(&self, node: &str) -> bool {
        self.degraded_nodes.contains(node)
    }

    pub fn is_evicted(&self, node: &str) -> bool {
        self.evicted_nodes.contains(node)
    }

    /// Faulted slots of `node`; empty when the node has none.
    pub fn faulted_devices(&self, node: &str) -> BTreeSet<usize> {
        self.faulted_devices.get(node).cloned().unwrap_or_default()
    }

    pub fn rescheduling_jobs(&self) -> impl Iterator<Item = &str> + '_ {
        self.rescheduling_jobs.iter().map(String::as_str)
    }

    /// Whether `record` sits on an evicted node or touches a faulted device.
    pub fn must_evict(&self, record: &AllocationRecord) -> bool {
        if self.is_evicted(&record.node) {
            return true;
        }
        self.faulted_devices
            .get(&record.node)
            .is_some_and(|faulted| record.devices.iter().any(|d| faulted.contains(d)))
    }
}
