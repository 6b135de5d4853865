//! Node-level scheduling policies.
//!
//! Each policy either rejects a node or contributes a score; a node is
//! feasible when every policy accepts it and its score is the sum of the
//! contributions, clamped below [`WORST_SCORE`].

use std::collections::BTreeSet;

use crate::affinity::{self, WORST_SCORE};
use crate::family::FamilyProfile;
use crate::requirement::TaskNpuRequirement;
use crate::reschedule::FaultSnapshot;
use crate::topology::NodeView;

pub const DEFAULT_DEGRADED_PENALTY: u32 = 16;
pub const DEFAULT_SUPER_POD_PENALTY: u32 = 24;

/// One task on one candidate node, with everything the policies look at.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub requirement: &'a TaskNpuRequirement,
    pub profile: &'a FamilyProfile,
    pub view: &'a NodeView,
    pub snapshot: &'a FaultSnapshot,
    pub sp_block: Option<usize>,
    /// Super-pod the task's job already occupies, if any
    pub job_super_pod: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Score(u32),
    Reject(String),
}

pub trait NodePolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict;

    /// Slots of `node` this policy hides from scoring and allocation.
    fn masked(&self, _node: &str, _snapshot: &FaultSnapshot) -> BTreeSet<usize> {
        BTreeSet::new()
    }
}

/// Scores the node with the family's affinity matrix.
#[derive(Debug, Default)]
pub struct TopologyAffinity;

impl NodePolicy for TopologyAffinity {
    fn name(&self) -> &'static str {
        "topology-affinity"
    }

    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        let req = candidate.requirement;
        let placed = match req.vnpu {
            Some(share) => {
                affinity::place_virtual(share, req.exclusive, candidate.view).map(|p| p.score)
            }
            None => affinity::place_whole(req.npu, candidate.view, candidate.profile)
                .map(|p| p.score),
        };
        match placed {
            Ok(score) => Verdict::Score(score),
            Err(reason) => Verdict::Reject(reason.to_string()),
        }
    }
}

/// Keeps tasks off evicted nodes and faulted devices, and biases against
/// nodes with a degraded network.
#[derive(Debug)]
pub struct FaultAware {
    pub degraded_penalty: u32,
}

impl Default for FaultAware {
    fn default() -> Self {
        Self {
            degraded_penalty: DEFAULT_DEGRADED_PENALTY,
        }
    }
}

impl NodePolicy for FaultAware {
    fn name(&self) -> &'static str {
        "fault-aware"
    }

    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        let node = candidate.view.node.as_str();
        if candidate.snapshot.is_evicted(node) {
            return Verdict::Reject("node is being evicted".to_string());
        }
        if candidate.snapshot.is_degraded(node) {
            return Verdict::Score(self.degraded_penalty);
        }
        Verdict::Score(0)
    }

    fn masked(&self, node: &str, snapshot: &FaultSnapshot) -> BTreeSet<usize> {
        snapshot.faulted_devices(node)
    }
}

/// Keeps super-pod jobs inside one super-pod. Inactive for other jobs.
#[derive(Debug)]
pub struct SuperPodAffinity {
    pub penalty: u32,
}

impl Default for SuperPodAffinity {
    fn default() -> Self {
        Self {
            penalty: DEFAULT_SUPER_POD_PENALTY,
        }
    }
}

impl NodePolicy for SuperPodAffinity {
    fn name(&self) -> &'static str {
        "super-pod-affinity"
    }

    fn evaluate(&self, candidate: &Candidate<'_>) -> Verdict {
        if candidate.sp_block.is_none() {
            return Verdict::Score(0);
        }
        let Some(super_pod) = candidate.view.super_pod.as_deref() else {
            return Verdict::Reject("node belongs to no super-pod".to_string());
        };
        match candidate.job_super_pod {
            Some(pinned) if pinned != super_pod => Verdict::Score(self.penalty),
            _ => Verdict::Score(0),
        }
    }
}

/// Ordered set of policies applied to every candidate.
pub struct PolicySet {
    policies: Vec<Box<dyn NodePolicy>>,
}

impl std::fmt::Debug for PolicySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.policies.iter().map(|p| p.name()))
            .finish()
    }
}

impl PolicySet {
    pub fn new(policies: Vec<Box<dyn NodePolicy>>) -> Self {
        Self { policies }
    }

    /// Topology affinity, fault awareness and super-pod affinity with the
    /// given penalties.
    pub fn standard(degraded_penalty: u32, super_pod_penalty: u32) -> Self {
        Self::new(vec![
            Box::new(TopologyAffinity),
            Box::new(FaultAware { degraded_penalty }),
            Box::new(SuperPodAffinity {
                penalty: super_pod_penalty,
            }),
        ])
    }

    /// Union of every policy's masked slots on `node`.
    pub fn masked(&self, node: &str, snapshot: &FaultSnapshot) -> BTreeSet<usize> {
        self.policies
            .iter()
            .flat_map(|policy| policy.masked(node, snapshot))
            .collect()
    }

    /// Total score of `candidate`, or the first rejection as
    /// `"<policy>: <reason>"`.
    pub fn evaluate(&self, candidate: &Candidate<'_>) -> core::result::Result<u32, String> {
        let mut total: u32 = 0;
        for policy in &self.policies {
            match policy.evaluate(candidate) {
                Verdict::Score(score) => total = total.saturating_add(score),
                Verdict::Reject(reason) => return Err(format!("{}: {reason}", policy.name())),
            }
        }
        Ok(total.min(WORST_SCORE - 1))
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::standard(DEFAULT_DEGRADED_PENALTY, DEFAULT_SUPER_POD_PENALTY)
    }
}
