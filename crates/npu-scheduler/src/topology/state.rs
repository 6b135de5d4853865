use std::collections::BTreeMap;
use std::collections::BTreeSet;

use api_types::annotations;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::raw::RawAnnotations;
use super::{Health, NodeTopology, NodeView, Occupancy, SlotRoom};
use crate::allocator::{AllocationRecord, LeaseKind};
use crate::error::{Result, ScheduleError};
use crate::family::FamilyRegistry;
use crate::requirement::TaskId;
use crate::vdevice::LeaseTable;

/// Everything the engine tracks for one node: the topology, the allocation
/// records that are the source of truth for occupancy, and virtual leases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    topology: NodeTopology,
    records: BTreeMap<TaskId, AllocationRecord>,
    leases: LeaseTable,
}

impl NodeState {
    /// Load a node and reconstruct the records and leases persisted in its
    /// annotations.
    ///
    /// # Errors
    ///
    /// Same as [`NodeTopology::load`].
    pub fn from_annotations(
        node: &str,
        values: &BTreeMap<String, String>,
        registry: &FamilyRegistry,
    ) -> Result<Self> {
        let raw = RawAnnotations::parse(node, values)?;
        let profile = registry
            .resolve(&raw.family)
            .attach_printable_lazy(|| format!("node {node}"))?;
        let topology = NodeTopology::from_raw(node, &raw, profile)?;

        let mut records = BTreeMap::new();
        for (task, devices) in &raw.assigned {
            let mut devices = devices.clone();
            devices.sort_unstable();
            records.insert(
                task.clone(),
                AllocationRecord {
                    task: task.clone(),
                    node: node.to_string(),
                    devices,
                    kind: LeaseKind::Whole,
                },
            );
        }

        let mut leases = LeaseTable::new();
        for (slot, task, share, exclusive) in &raw.leases {
            if records.contains_key(task) {
                return Err(Report::new(ScheduleError::malformed(
                    node,
                    format!("task {task} leases more than one slot"),
                )));
            }
            leases
                .lease(node, *slot, *share, task, *exclusive)
                .change_context_lazy(|| ScheduleError::malformed(node, "vnpu leases conflict"))?;
            records.insert(
                task.clone(),
                AllocationRecord {
                    task: task.clone(),
                    node: node.to_string(),
                    devices: vec![*slot],
                    kind: LeaseKind::Virtual {
                        share: *share,
                        exclusive: *exclusive,
                    },
                },
            );
        }

        let mut state = Self {
            topology,
            records,
            leases,
        };
        state.refresh();
        Ok(state)
    }

    pub fn topology(&self) -> &NodeTopology {
        &self.topology
    }

    pub fn name(&self) -> &str {
        self.topology.name()
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn record(&self, task: &TaskId) -> Option<&AllocationRecord> {
        self.records.get(task)
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> + '_ {
        self.records.values()
    }

    /// Copy what scoring needs, hiding the slots in `masked`.
    pub fn view(&self, masked: &BTreeSet<usize>) -> NodeView {
        let topology = &self.topology;
        let free_by_group = (0..topology.groups().len())
            .map(|group| {
                topology
                    .free_slots_in_group(group)
                    .into_iter()
                    .filter(|slot| !masked.contains(slot))
                    .collect()
            })
            .collect();
        let lease_room = (0..topology.capacity())
            .filter(|slot| !masked.contains(slot))
            .filter(|slot| topology.leasable(*slot))
            .filter(|slot| topology.health(*slot) == Some(Health::Healthy))
            .filter(|slot| !self.leases.is_exclusive(*slot))
            .map(|slot| SlotRoom {
                slot,
                remaining: self.leases.remaining(slot),
                shared: self.leases.is_leased(slot),
            })
            .filter(|room| room.remaining > 0)
            .collect();

        NodeView {
            node: topology.name().to_string(),
            capacity: topology.capacity(),
            super_pod: topology.super_pod().map(str::to_string),
            free_by_group,
            lease_room,
        }
    }

    /// Store `record`, taking its devices or its lease.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::InsufficientTopology`] if a whole device is not free
    ///   or the leased slot is whole-assigned or unhealthy
    /// - [`ScheduleError::OverCommitted`] if the lease would exceed one device
    pub(crate) fn commit(&mut self, record: AllocationRecord) -> Result<()> {
        let node = self.topology.name().to_string();
        let insufficient = || {
            Report::new(ScheduleError::InsufficientTopology {
                node: node.clone(),
                task: record.task.to_string(),
            })
        };

        match record.kind {
            LeaseKind::Whole => {
                if let Some(slot) = record
                    .devices
                    .iter()
                    .find(|slot| self.topology.occupancy(**slot) != Some(&Occupancy::Free))
                {
                    return Err(insufficient().attach_printable(format!("slot {slot} is taken")));
                }
            }
            LeaseKind::Virtual { share, exclusive } => {
                let &[slot] = record.devices.as_slice() else {
                    return Err(insufficient().attach_printable("a lease covers exactly one slot"));
                };
                if !self.topology.leasable(slot)
                    || self.topology.health(slot) != Some(Health::Healthy)
                {
                    return Err(
                        insufficient().attach_printable(format!("slot {slot} cannot be leased"))
                    );
                }
                self.leases.lease(&node, slot, share, &record.task, exclusive)?;
            }
        }

        debug!(node = %node, task = %record.task, devices = ?record.devices, "record committed");
        self.records.insert(record.task.clone(), record);
        self.refresh();
        Ok(())
    }

    /// Drop `task`'s record and return it. Unknown tasks are a no-op.
    pub(crate) fn remove(&mut self, task: &TaskId) -> Option<AllocationRecord> {
        let record = self.records.remove(task)?;
        if let LeaseKind::Virtual { .. } = record.kind {
            for slot in &record.devices {
                self.leases.release(*slot, task);
            }
        }
        self.refresh();
        Some(record)
    }

    /// Carry records and leases over onto freshly loaded annotations. Records
    /// whose devices no longer fit the new topology are dropped and returned.
    pub(crate) fn adopt(&mut self, previous: NodeState) -> Vec<AllocationRecord> {
        let mut dropped = Vec::new();
        for (task, record) in previous.records {
            if self.records.contains_key(&task) {
                continue;
            }
            if let Err(err) = self.commit(record.clone()) {
                debug!(node = %self.name(), task = %task, error = ?err, "record dropped on reload");
                dropped.push(record);
            }
        }
        dropped
    }

    /// The node annotations reflecting the current records and leases.
    pub fn annotation_patch(&self) -> BTreeMap<String, String> {
        let topology = &self.topology;
        let slots = 0..topology.capacity();

        let free: Vec<usize> = slots
            .clone()
            .filter(|slot| topology.is_advertised(*slot))
            .filter(|slot| topology.health(*slot) == Some(Health::Healthy))
            .filter(|slot| {
                !matches!(topology.occupancy(*slot), Some(Occupancy::Assigned(_)))
            })
            .collect();
        let unhealthy: Vec<usize> = slots
            .filter(|slot| topology.health(*slot) == Some(Health::Faulted))
            .collect();

        let whole: Vec<(String, &[usize])> = self
            .records
            .values()
            .filter(|record| record.kind == LeaseKind::Whole)
            .map(|record| (record.task.to_string(), record.devices.as_slice()))
            .collect();
        let leases: Vec<annotations::LeaseEntry> = self
            .leases
            .iter()
            .map(|(slot, task, share)| annotations::LeaseEntry {
                slot,
                task: task.to_string(),
                permille: share.permille(),
                exclusive: self.leases.is_exclusive(slot),
            })
            .collect();

        let mut patch = BTreeMap::new();
        patch.insert(
            annotations::FAMILY.to_string(),
            topology.family().to_string(),
        );
        patch.insert(
            annotations::CAPACITY.to_string(),
            topology.capacity().to_string(),
        );
        if let Some(super_pod) = topology.super_pod() {
            patch.insert(annotations::SUPER_POD_ID.to_string(), super_pod.to_string());
        }
        patch.insert(
            annotations::FREE.to_string(),
            annotations::format_index_list(&free),
        );
        patch.insert(
            annotations::UNHEALTHY.to_string(),
            annotations::format_index_list(&unhealthy),
        );
        patch.insert(
            annotations::ASSIGNED.to_string(),
            annotations::format_assigned(whole.iter().map(|(t, d)| (t.as_str(), *d))),
        );
        patch.insert(
            annotations::VNPU.to_string(),
            annotations::format_leases(&leases),
        );
        patch
    }

    fn refresh(&mut self) {
        let whole = self
            .records
            .values()
            .filter(|record| record.kind == LeaseKind::Whole)
            .map(|record| (&record.task, record.devices.as_slice()));
        self.topology.rebuild(whole, self.leases.leased_slots());
    }
}
