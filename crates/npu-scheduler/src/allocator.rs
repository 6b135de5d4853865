//! Commit placements onto a node.
//!
//! The allocator always re-plans against the node state it holds the lock
//! for, so a placement scored earlier in the cycle is never trusted blindly.

use std::collections::BTreeSet;

use error_stack::Report;
use tracing::{debug, info};

use crate::affinity::{self, Infeasible};
use crate::error::{Result, ScheduleError};
use crate::family::FamilyProfile;
use crate::requirement::{TaskId, TaskNpuRequirement};
use crate::topology::{NodeState, NodeView};
use crate::vdevice::Share;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseKind {
    Whole,
    /// An `exclusive` lease keeps other leases off its slot
    Virtual { share: Share, exclusive: bool },
}

/// The devices one task holds on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub task: TaskId,
    pub node: String,
    /// Ascending slot indices; exactly one for virtual leases
    pub devices: Vec<usize>,
    pub kind: LeaseKind,
}

impl AllocationRecord {
    pub fn job(&self) -> &str {
        self.task.job()
    }
}

/// The slots `requested` whole devices would take on `view`.
///
/// Follows the scorer's group choice and takes the lowest free slots of each
/// chosen group.
pub fn plan(
    requested: usize,
    view: &NodeView,
    profile: &FamilyProfile,
) -> core::result::Result<Vec<usize>, Infeasible> {
    let placement = affinity::place_whole(requested, view, profile)?;
    let mut devices: Vec<usize> = placement
        .takes
        .iter()
        .flat_map(|take| {
            view.free_by_group[take.group]
                .iter()
                .copied()
                .take(take.count)
        })
        .collect();
    devices.sort_unstable();
    Ok(devices)
}

/// Place `requirement` on `state` and commit the record.
///
/// Allocating a task that already holds a record on this node returns that
/// record unchanged.
///
/// # Errors
///
/// - [`ScheduleError::InsufficientTopology`] if the node can no longer host
///   the task
/// - [`ScheduleError::OverCommitted`] if a lease would exceed one device
pub fn allocate(
    state: &mut NodeState,
    requirement: &TaskNpuRequirement,
    profile: &FamilyProfile,
    masked: &BTreeSet<usize>,
) -> Result<AllocationRecord> {
    if let Some(existing) = state.record(&requirement.task) {
        debug!(node = %state.name(), task = %requirement.task, "task already bound here");
        return Ok(existing.clone());
    }

    let view = state.view(masked);
    let insufficient = |reason: Infeasible| {
        Report::new(ScheduleError::InsufficientTopology {
            node: view.node.clone(),
            task: requirement.task.to_string(),
        })
        .attach_printable(reason.to_string())
    };

    let record = match requirement.vnpu {
        Some(share) => {
            let placement = affinity::place_virtual(share, requirement.exclusive, &view)
                .map_err(insufficient)?;
            AllocationRecord {
                task: requirement.task.clone(),
                node: view.node.clone(),
                devices: vec![placement.slot],
                kind: LeaseKind::Virtual {
                    share,
                    exclusive: requirement.exclusive,
                },
            }
        }
        None => AllocationRecord {
            task: requirement.task.clone(),
            node: view.node.clone(),
            devices: plan(requirement.npu, &view, profile).map_err(insufficient)?,
            kind: LeaseKind::Whole,
        },
    };

    state.commit(record.clone())?;
    info!(
        node = %record.node,
        task = %record.task,
        devices = ?record.devices,
        "allocated"
    );
    Ok(record)
}

/// Drop `task`'s record from `state`. Releasing an unknown task is a no-op.
pub fn release(state: &mut NodeState, task: &TaskId) -> Option<AllocationRecord> {
    match state.remove(task) {
        Some(record) => {
            info!(node = %record.node, task = %task, devices = ?record.devices, "released");
            Some(record)
        }
        None => {
            debug!(node = %state.name(), task = %task, "nothing to release");
            None
        }
    }
}
