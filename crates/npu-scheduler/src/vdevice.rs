//! Virtual device leases.
//!
//! A physical slot can be cut into fractional leases shared by several
//! tasks. Shares are kept as integer per-mille so that sums are exact; the
//! sum on one slot never exceeds [`Share::WHOLE`]. An exclusive lease keeps
//! its slot to itself until released.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use tracing::debug;

use crate::error::{Result, ScheduleError};
use crate::requirement::TaskId;

/// Fraction of one device, in per-mille.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Share(u32);

impl Share {
    pub const WHOLE: Share = Share(1000);

    /// `ratio` of one device, rounded to per-mille. Must lie in `(0, 1]`.
    pub fn from_ratio(ratio: f64) -> Option<Self> {
        if !ratio.is_finite() || ratio <= 0.0 || ratio > 1.0 {
            return None;
        }
        Self::from_permille((ratio * 1000.0).round() as u32)
    }

    pub fn from_permille(permille: u32) -> Option<Self> {
        (1..=Self::WHOLE.0).contains(&permille).then_some(Self(permille))
    }

    pub const fn permille(self) -> u32 {
        self.0
    }
}

/// An active fractional lease on one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualLease {
    pub node: String,
    pub slot: usize,
    pub task: TaskId,
    pub share: Share,
}

/// Per-node table of virtual leases, keyed by slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseTable {
    slots: BTreeMap<usize, BTreeMap<TaskId, Share>>,
    /// Slots whose single lease was taken exclusively
    exclusive: BTreeSet<usize>,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-mille already leased out on `slot`.
    pub fn in_use(&self, slot: usize) -> u32 {
        self.slots
            .get(&slot)
            .map(|leases| leases.values().map(|s| s.permille()).sum())
            .unwrap_or(0)
    }

    /// Per-mille still available on `slot`.
    pub fn remaining(&self, slot: usize) -> u32 {
        Share::WHOLE.permille().saturating_sub(self.in_use(slot))
    }

    pub fn is_leased(&self, slot: usize) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn is_exclusive(&self, slot: usize) -> bool {
        self.exclusive.contains(&slot)
    }

    /// Take `share` of `slot` for `task`. An `exclusive` lease needs an
    /// unleased slot and bars every later lease on it.
    ///
    /// Re-leasing a slot the task already holds returns the existing lease.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::InsufficientTopology`] if the slot is held
    ///   exclusively, or an exclusive lease finds it already shared
    /// - [`ScheduleError::OverCommitted`] if the slot would exceed one device
    pub fn lease(
        &mut self,
        node: &str,
        slot: usize,
        share: Share,
        task: &TaskId,
        exclusive: bool,
    ) -> Result<VirtualLease> {
        if let Some(existing) = self.slots.get(&slot).and_then(|l| l.get(task)) {
            debug!(node, slot, task = %task, "lease already held");
            return Ok(VirtualLease {
                node: node.to_string(),
                slot,
                task: task.clone(),
                share: *existing,
            });
        }

        if self.is_exclusive(slot) || (exclusive && self.is_leased(slot)) {
            return Err(Report::new(ScheduleError::InsufficientTopology {
                node: node.to_string(),
                task: task.to_string(),
            })
            .attach_printable(format!("slot {slot} cannot be shared")));
        }

        let in_use = self.in_use(slot);
        if in_use + share.permille() > Share::WHOLE.permille() {
            return Err(Report::new(ScheduleError::OverCommitted {
                node: node.to_string(),
                slot,
                requested: share.permille(),
                in_use,
            }));
        }

        self.slots
            .entry(slot)
            .or_default()
            .insert(task.clone(), share);
        if exclusive {
            self.exclusive.insert(slot);
        }
        Ok(VirtualLease {
            node: node.to_string(),
            slot,
            task: task.clone(),
            share,
        })
    }

    /// Drop `task`'s lease on `slot`. Unknown leases are ignored.
    pub fn release(&mut self, slot: usize, task: &TaskId) -> Option<Share> {
        let leases = self.slots.get_mut(&slot)?;
        let released = leases.remove(task);
        if leases.is_empty() {
            self.slots.remove(&slot);
            self.exclusive.remove(&slot);
        }
        released
    }

    /// Slots carrying at least one lease.
    pub fn leased_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.keys().copied()
    }

    /// Every lease as `(slot, task, share)`, ordered by slot then task.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &TaskId, Share)> + '_ {
        self.slots.iter().flat_map(|(slot, leases)| {
            leases
                .iter()
                .map(move |(task, share)| (*slot, task, *share))
        })
    }
}
