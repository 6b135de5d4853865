//! Per-node device topology.
//!
//! A [`NodeTopology`] is rebuilt from node annotations each cycle. Its
//! occupancy is a projection of the node's allocation records and virtual
//! leases, recomputed after every bind or release.

mod raw;
mod state;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use error_stack::Report;
use error_stack::ResultExt;

pub use state::NodeState;

use crate::error::{Result, ScheduleError};
use crate::family::{FamilyProfile, FamilyRegistry, FamilyTag, Group};
use crate::requirement::TaskId;
use raw::RawAnnotations;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Faulted,
}

/// Derived state of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Occupancy {
    Free,
    Assigned(TaskId),
    /// Carries virtual leases; excluded from whole-device allocation
    Leased,
    /// Faulted or never advertised by the device plugin
    Unavailable,
}

/// Idle room on one slot for virtual placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRoom {
    pub slot: usize,
    /// Per-mille still available
    pub remaining: u32,
    /// Whether other leases already share the slot
    pub shared: bool,
}

/// Immutable copy of what the scorer and allocator need from a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeView {
    pub node: String,
    pub capacity: usize,
    pub super_pod: Option<String>,
    /// Free slots per group, ascending
    pub free_by_group: Vec<Vec<usize>>,
    pub lease_room: Vec<SlotRoom>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTopology {
    name: String,
    family: FamilyTag,
    capacity: usize,
    groups: Vec<Group>,
    super_pod: Option<String>,
    health: Vec<Health>,
    advertised: Vec<bool>,
    occupancy: Vec<Occupancy>,
    group_free: Vec<usize>,
}

impl NodeTopology {
    /// Parse a node's annotations into its topology.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::MalformedTopology`] if indices are out of range or
    ///   duplicated, lists contradict each other, or the family's grouping
    ///   cannot be applied to the node
    /// - [`ScheduleError::UnsupportedFamily`] if the family tag is unknown
    pub fn load(
        node: &str,
        annotations: &BTreeMap<String, String>,
        registry: &FamilyRegistry,
    ) -> Result<Self> {
        let raw = RawAnnotations::parse(node, annotations)?;
        let profile = registry
            .resolve(&raw.family)
            .attach_printable_lazy(|| format!("node {node}"))?;
        let mut topology = Self::from_raw(node, &raw, profile)?;
        let leased: BTreeSet<usize> = raw.leases.iter().map(|l| l.0).collect();
        topology.rebuild(
            raw.assigned.iter().map(|(t, d)| (t, d.as_slice())),
            leased,
        );
        Ok(topology)
    }

    fn from_raw(node: &str, raw: &RawAnnotations, profile: &FamilyProfile) -> Result<Self> {
        let malformed = |message: String| Report::new(ScheduleError::malformed(node, message));

        let highest = raw
            .free
            .iter()
            .chain(raw.unhealthy.iter())
            .chain(raw.assigned.iter().flat_map(|(_, d)| d.iter()))
            .chain(raw.leases.iter().map(|l| &l.0))
            .copied()
            .max();
        let capacity = profile
            .resolve_capacity(raw.capacity, highest)
            .map_err(malformed)?;

        let free = slot_set(node, "free", &raw.free, capacity)?;
        let unhealthy = slot_set(node, "unhealthy", &raw.unhealthy, capacity)?;

        let mut assigned = BTreeSet::new();
        let mut tasks = BTreeSet::new();
        for (task, devices) in &raw.assigned {
            if !tasks.insert(task) {
                return Err(malformed(format!("task {task} assigned twice")));
            }
            if devices.is_empty() {
                return Err(malformed(format!("task {task} assigned no devices")));
            }
            for slot in slot_set(node, "assigned", devices, capacity)? {
                if !assigned.insert(slot) {
                    return Err(malformed(format!("slot {slot} assigned to two tasks")));
                }
            }
        }

        let mut lease_sums: BTreeMap<usize, u32> = BTreeMap::new();
        let mut lease_keys = BTreeSet::new();
        for (slot, task, share, _) in &raw.leases {
            if *slot >= capacity {
                return Err(malformed(format!(
                    "leased slot {slot} out of range 0..{capacity}"
                )));
            }
            if !lease_keys.insert((*slot, task)) {
                return Err(malformed(format!("task {task} leases slot {slot} twice")));
            }
            if tasks.contains(task) {
                return Err(malformed(format!(
                    "task {task} holds both whole devices and a lease"
                )));
            }
            *lease_sums.entry(*slot).or_default() += share.permille();
        }
        for (slot, sum) in &lease_sums {
            if *sum > 1000 {
                return Err(malformed(format!(
                    "slot {slot} leased {sum} per-mille, above one device"
                )));
            }
            if assigned.contains(slot) {
                return Err(malformed(format!(
                    "slot {slot} is both leased and whole-assigned"
                )));
            }
        }

        if let Some(slot) = free.intersection(&unhealthy).next() {
            return Err(malformed(format!("slot {slot} is both free and unhealthy")));
        }
        if let Some(slot) = free.intersection(&assigned).next() {
            return Err(malformed(format!("slot {slot} is both free and assigned")));
        }

        let health = (0..capacity)
            .map(|slot| {
                if unhealthy.contains(&slot) {
                    Health::Faulted
                } else {
                    Health::Healthy
                }
            })
            .collect();
        let advertised = (0..capacity)
            .map(|slot| {
                free.contains(&slot) || assigned.contains(&slot) || lease_sums.contains_key(&slot)
            })
            .collect();
        let groups = profile.partition(capacity);
        let group_free = vec![0; groups.len()];

        Ok(Self {
            name: node.to_string(),
            family: profile.tag,
            capacity,
            groups,
            super_pod: raw.super_pod.clone(),
            health,
            advertised,
            occupancy: vec![Occupancy::Unavailable; capacity],
            group_free,
        })
    }

    /// Recompute occupancy and cached per-group free counts.
    pub fn rebuild<'a, A, L>(&mut self, assigned: A, leased: L)
    where
        A: IntoIterator<Item = (&'a TaskId, &'a [usize])>,
        L: IntoIterator<Item = usize>,
    {
        for slot in 0..self.capacity {
            self.occupancy[slot] =
                if self.advertised[slot] && self.health[slot] == Health::Healthy {
                    Occupancy::Free
                } else {
                    Occupancy::Unavailable
                };
        }
        for slot in leased {
            if let Some(occupancy) = self.occupancy.get_mut(slot) {
                *occupancy = Occupancy::Leased;
            }
        }
        for (task, devices) in assigned {
            for slot in devices {
                if let Some(occupancy) = self.occupancy.get_mut(*slot) {
                    *occupancy = Occupancy::Assigned(task.clone());
                }
            }
        }
        for (idx, group) in self.groups.iter().enumerate() {
            self.group_free[idx] = group
                .slots
                .clone()
                .filter(|slot| self.occupancy[*slot] == Occupancy::Free)
                .count();
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family(&self) -> FamilyTag {
        self.family
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn super_pod(&self) -> Option<&str> {
        self.super_pod.as_deref()
    }

    /// The communication-group partition of the node's slots.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Free slots of `group`, ascending. Unknown groups have none.
    pub fn free_slots_in_group(&self, group: usize) -> Vec<usize> {
        self.groups
            .get(group)
            .map(|g| {
                g.slots
                    .clone()
                    .filter(|slot| self.occupancy[*slot] == Occupancy::Free)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every free slot on the node, ascending.
    pub fn free_slots(&self) -> Vec<usize> {
        (0..self.capacity)
            .filter(|slot| self.occupancy[*slot] == Occupancy::Free)
            .collect()
    }

    /// Cached free count of `group`.
    pub fn group_free(&self, group: usize) -> usize {
        self.group_free.get(group).copied().unwrap_or(0)
    }

    pub fn occupancy(&self, slot: usize) -> Option<&Occupancy> {
        self.occupancy.get(slot)
    }

    pub fn health(&self, slot: usize) -> Option<Health> {
        self.health.get(slot).copied()
    }

    pub fn is_advertised(&self, slot: usize) -> bool {
        self.advertised.get(slot).copied().unwrap_or(false)
    }

    /// Slots usable for leases: advertised, healthy, not whole-assigned.
    fn leasable(&self, slot: usize) -> bool {
        matches!(
            self.occupancy.get(slot),
            Some(Occupancy::Free | Occupancy::Leased)
        )
    }
}

/// Range- and duplicate-check one annotation list.
fn slot_set(
    node: &str,
    what: &str,
    indices: &[usize],
    capacity: usize,
) -> Result<BTreeSet<usize>> {
    let mut set = BTreeSet::new();
    for slot in indices {
        if *slot >= capacity {
            return Err(Report::new(ScheduleError::malformed(
                node,
                format!("{what} slot {slot} out of range 0..{capacity}"),
            )));
        }
        if !set.insert(*slot) {
            return Err(Report::new(ScheduleError::malformed(
                node,
                format!("{what} slot {slot} listed twice"),
            )));
        }
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use api_types::annotations;

    use super::*;

    fn node_annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn malformed_message(result: Result<NodeTopology>) -> String {
        match result.unwrap_err().current_context() {
            ScheduleError::MalformedTopology { message, .. } => message.clone(),
            other => panic!("expected malformed topology, got {other}"),
        }
    }

    #[test]
    fn load_ring_node() {
        let registry = FamilyRegistry::builtin();
        let topology = NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910"),
                (annotations::FREE, "0,1,2,4,5,6,7"),
                (annotations::ASSIGNED, "job-a/w0=3"),
            ]),
            &registry,
        )
        .unwrap();

        assert_eq!(topology.capacity(), 8);
        assert_eq!(topology.groups().len(), 2);
        assert_eq!(topology.free_slots_in_group(0), vec![0, 1, 2]);
        assert_eq!(topology.free_slots_in_group(1), vec![4, 5, 6, 7]);
        assert_eq!(topology.group_free(0), 3);
        assert_eq!(
            topology.occupancy(3),
            Some(&Occupancy::Assigned(TaskId::new("job-a", "w0")))
        );
        assert!(topology.free_slots_in_group(7).is_empty());
    }

    #[test]
    fn unhealthy_and_unlisted_slots_are_unavailable() {
        let registry = FamilyRegistry::builtin();
        let topology = NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910"),
                (annotations::FREE, "0,1,2"),
                (annotations::UNHEALTHY, "3"),
            ]),
            &registry,
        )
        .unwrap();

        assert_eq!(topology.free_slots(), vec![0, 1, 2]);
        assert_eq!(topology.occupancy(3), Some(&Occupancy::Unavailable));
        assert_eq!(topology.health(3), Some(Health::Faulted));
        assert_eq!(topology.occupancy(5), Some(&Occupancy::Unavailable));
        assert!(!topology.is_advertised(5));
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        let registry = FamilyRegistry::builtin();
        let message = malformed_message(NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910"),
                (annotations::FREE, "0,8"),
            ]),
            &registry,
        ));
        assert_eq!(message, "free slot 8 out of range 0..8");
    }

    #[test]
    fn duplicate_index_is_malformed() {
        let registry = FamilyRegistry::builtin();
        let message = malformed_message(NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910"),
                (annotations::FREE, "0,1,1"),
            ]),
            &registry,
        ));
        assert_eq!(message, "free slot 1 listed twice");
    }

    #[test]
    fn contradicting_lists_are_malformed() {
        let registry = FamilyRegistry::builtin();
        let cases = [
            (
                vec![
                    (annotations::FREE, "0,1"),
                    (annotations::UNHEALTHY, "1"),
                ],
                "slot 1 is both free and unhealthy",
            ),
            (
                vec![
                    (annotations::FREE, "0,1"),
                    (annotations::ASSIGNED, "j/a=1"),
                ],
                "slot 1 is both free and assigned",
            ),
            (
                vec![(annotations::ASSIGNED, "j/a=1;j/b=1")],
                "slot 1 assigned to two tasks",
            ),
            (
                vec![
                    (annotations::ASSIGNED, "j/a=2"),
                    (annotations::VNPU, "2@j/b=500"),
                ],
                "slot 2 is both leased and whole-assigned",
            ),
            (
                vec![(annotations::VNPU, "2@j/b=600;2@j/c=600")],
                "slot 2 leased 1200 per-mille, above one device",
            ),
        ];

        for (pairs, expected) in cases {
            let mut pairs = pairs;
            pairs.push((annotations::FAMILY, "ascend910b"));
            let loaded = NodeTopology::load("node-1", &node_annotations(&pairs), &registry);
            let message = malformed_message(loaded);
            assert_eq!(message, expected);
        }
    }

    #[test]
    fn ungroupable_capacity_is_malformed() {
        let registry = FamilyRegistry::builtin();
        let message = malformed_message(NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910-card"),
                (annotations::CAPACITY, "3"),
                (annotations::FREE, "0,1,2"),
            ]),
            &registry,
        ));
        assert_eq!(message, "3 devices cannot be grouped in 2-device groups");
    }

    #[test]
    fn unknown_family_is_unsupported() {
        let registry = FamilyRegistry::builtin();
        let err = NodeTopology::load(
            "node-1",
            &node_annotations(&[(annotations::FAMILY, "tpu"), (annotations::FREE, "0")]),
            &registry,
        )
        .unwrap_err();
        assert!(matches!(
            err.current_context(),
            ScheduleError::UnsupportedFamily { .. }
        ));
    }

    #[test]
    fn card_node_capacity_is_inferred() {
        let registry = FamilyRegistry::builtin();
        let topology = NodeTopology::load(
            "node-1",
            &node_annotations(&[
                (annotations::FAMILY, "ascend910-card"),
                (annotations::FREE, "0,1,2"),
            ]),
            &registry,
        )
        .unwrap();
        assert_eq!(topology.capacity(), 4);
        assert_eq!(topology.groups().len(), 2);
        assert_eq!(topology.free_slots_in_group(1), vec![2]);
    }
}
