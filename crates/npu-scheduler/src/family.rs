//! Accelerator family registry.
//!
//! Every supported card generation / form factor is one [`FamilyProfile`]
//! record: its slot layout, legal request sizes, affinity matrix and
//! virtual-slicing templates. Dispatch is a map lookup on [`FamilyTag`].

use std::collections::HashMap;
use std::ops::Range;
use std::str::FromStr;

use error_stack::Report;
use serde::Deserialize;
use serde::Serialize;

use crate::affinity::matrix::{self, AffinityMatrix};
use crate::error::{Result, ScheduleError};

/// Closed set of supported accelerator families.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    derive_more::Display,
)]
pub enum FamilyTag {
    /// Eight-device training module, two HCCS rings of four
    #[display("ascend910")]
    #[serde(rename = "ascend910")]
    Ascend910,
    /// Eight-device full-mesh module
    #[display("ascend910b")]
    #[serde(rename = "ascend910b")]
    Ascend910B,
    /// Sixteen-device server made of two full-mesh modules
    #[display("ascend910b-x16")]
    #[serde(rename = "ascend910b-x16")]
    Ascend910BX16,
    /// PCIe training cards, two devices per card
    #[display("ascend910-card")]
    #[serde(rename = "ascend910-card")]
    Ascend910Card,
    /// Inference cards, two chips per card, no inter-card fabric
    #[display("ascend310p")]
    #[serde(rename = "ascend310p")]
    Ascend310P,
    /// Sixteen-device super-pod nodes
    #[display("ascend910-a3")]
    #[serde(rename = "ascend910-a3")]
    Ascend910A3,
}

impl FamilyTag {
    pub const ALL: [FamilyTag; 6] = [
        FamilyTag::Ascend910,
        FamilyTag::Ascend910B,
        FamilyTag::Ascend910BX16,
        FamilyTag::Ascend910Card,
        FamilyTag::Ascend310P,
        FamilyTag::Ascend910A3,
    ];
}

impl FromStr for FamilyTag {
    type Err = Report<ScheduleError>;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|tag| tag.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                Report::new(ScheduleError::UnsupportedFamily {
                    family: s.to_string(),
                })
            })
    }
}

/// How many slots a node of the family carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeCapacity {
    /// Every node has exactly this many slots
    Fixed(usize),
    /// Nodes carry a multiple of the group size, up to this many slots
    UpTo(usize),
}

/// Per-task device counts a family accepts in whole-device mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalCounts {
    List(&'static [usize]),
    /// Inclusive range
    Range(usize, usize),
}

impl LegalCounts {
    pub fn contains(&self, count: usize) -> bool {
        match self {
            Self::List(list) => list.contains(&count),
            Self::Range(lo, hi) => (*lo..=*hi).contains(&count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Exactly one task per job
    Single,
    /// Any number of tasks per job
    Distributed,
}

/// AI-core templates a device can be cut into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualSlicing {
    pub aicore_total: u32,
    pub templates: &'static [u32],
}

impl VirtualSlicing {
    /// The template matching `ratio` of the device, if any.
    pub fn template_for(&self, ratio: f64) -> Option<u32> {
        self.templates.iter().copied().find(|cores| {
            let template_ratio = f64::from(*cores) / f64::from(self.aicore_total);
            (template_ratio - ratio).abs() < 1e-6
        })
    }
}

/// A communication group: a contiguous run of slots on one ring or mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub id: usize,
    pub slots: Range<usize>,
}

/// Everything the engine needs to know about one family.
#[derive(Debug, Clone)]
pub struct FamilyProfile {
    pub tag: FamilyTag,
    pub capacity: NodeCapacity,
    pub group_size: usize,
    pub legal_counts: LegalCounts,
    /// Whether one task may take devices from more than one group
    pub allow_cross_group: bool,
    /// Per-task count every task of a multi-task job must request
    pub distributed_task_npu: Option<usize>,
    pub parallelism: Parallelism,
    pub matrix: &'static AffinityMatrix,
    pub virtual_slicing: Option<VirtualSlicing>,
    pub super_pod: bool,
}

impl FamilyProfile {
    pub fn builtin(tag: FamilyTag) -> Self {
        match tag {
            FamilyTag::Ascend910 => Self {
                tag,
                capacity: NodeCapacity::Fixed(8),
                group_size: 4,
                legal_counts: LegalCounts::List(&[1, 2, 4, 8]),
                allow_cross_group: false,
                distributed_task_npu: Some(8),
                parallelism: Parallelism::Distributed,
                matrix: &matrix::RING4,
                virtual_slicing: None,
                super_pod: false,
            },
            FamilyTag::Ascend910B => Self {
                tag,
                capacity: NodeCapacity::Fixed(8),
                group_size: 8,
                legal_counts: LegalCounts::Range(1, 8),
                allow_cross_group: false,
                distributed_task_npu: Some(8),
                parallelism: Parallelism::Distributed,
                matrix: &matrix::MESH8,
                virtual_slicing: Some(VirtualSlicing {
                    aicore_total: 24,
                    templates: &[3, 6, 12],
                }),
                super_pod: false,
            },
            FamilyTag::Ascend910BX16 => Self {
                tag,
                capacity: NodeCapacity::Fixed(16),
                group_size: 8,
                legal_counts: LegalCounts::List(&[1, 2, 3, 4, 5, 6, 7, 8, 16]),
                allow_cross_group: false,
                distributed_task_npu: Some(16),
                parallelism: Parallelism::Distributed,
                matrix: &matrix::MESH8,
                virtual_slicing: None,
                super_pod: false,
            },
            FamilyTag::Ascend910Card => Self {
                tag,
                capacity: NodeCapacity::UpTo(8),
                group_size: 2,
                legal_counts: LegalCounts::List(&[1, 2]),
                allow_cross_group: false,
                distributed_task_npu: Some(2),
                parallelism: Parallelism::Distributed,
                matrix: &matrix::PAIR2,
                virtual_slicing: None,
                super_pod: false,
            },
            FamilyTag::Ascend310P => Self {
                tag,
                capacity: NodeCapacity::UpTo(64),
                group_size: 2,
                legal_counts: LegalCounts::Range(1, 64),
                allow_cross_group: true,
                distributed_task_npu: None,
                parallelism: Parallelism::Single,
                matrix: &matrix::PAIR2,
                virtual_slicing: Some(VirtualSlicing {
                    aicore_total: 8,
                    templates: &[1, 2, 4],
                }),
                super_pod: false,
            },
            FamilyTag::Ascend910A3 => Self {
                tag,
                capacity: NodeCapacity::Fixed(16),
                group_size: 8,
                legal_counts: LegalCounts::List(&[1, 2, 4, 8, 16]),
                allow_cross_group: false,
                distributed_task_npu: Some(16),
                parallelism: Parallelism::Distributed,
                matrix: &matrix::MESH8,
                virtual_slicing: None,
                super_pod: true,
            },
        }
    }

    /// Largest number of slots a node of this family can carry.
    pub fn max_capacity(&self) -> usize {
        match self.capacity {
            NodeCapacity::Fixed(n) | NodeCapacity::UpTo(n) => n,
        }
    }

    /// Split `capacity` slots into communication groups.
    pub fn partition(&self, capacity: usize) -> Vec<Group> {
        (0..capacity)
            .step_by(self.group_size)
            .enumerate()
            .map(|(id, start)| Group {
                id,
                slots: start..(start + self.group_size).min(capacity),
            })
            .collect()
    }

    /// Work out a node's slot count from its declared capacity or, for
    /// families with variable node sizes, from the highest index it lists.
    pub fn resolve_capacity(
        &self,
        declared: Option<usize>,
        highest_index: Option<usize>,
    ) -> core::result::Result<usize, String> {
        let capacity = match (self.capacity, declared) {
            (NodeCapacity::Fixed(n), Some(d)) if d != n => {
                return Err(format!("{} nodes carry {n} devices, not {d}", self.tag));
            }
            (NodeCapacity::Fixed(n), _) => n,
            (NodeCapacity::UpTo(_), Some(d)) => d,
            (NodeCapacity::UpTo(_), None) => match highest_index {
                Some(i) => (i / self.group_size + 1) * self.group_size,
                None => {
                    return Err(format!(
                        "cannot infer device count for {} without a capacity or device list",
                        self.tag
                    ));
                }
            },
        };
        if capacity == 0 || capacity % self.group_size != 0 {
            return Err(format!(
                "{capacity} devices cannot be grouped in {}-device groups",
                self.group_size
            ));
        }
        if capacity > self.max_capacity() {
            return Err(format!(
                "{capacity} devices exceeds the {} limit of {}",
                self.tag,
                self.max_capacity()
            ));
        }
        Ok(capacity)
    }
}

/// Registry mapping family tags to their profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    profiles: HashMap<FamilyTag, FamilyProfile>,
}

impl FamilyRegistry {
    /// Registry with every built-in family enabled.
    pub fn builtin() -> Self {
        Self::with_families(&FamilyTag::ALL)
    }

    /// Registry restricted to `tags`; other families resolve as unsupported.
    pub fn with_families(tags: &[FamilyTag]) -> Self {
        let profiles = tags
            .iter()
            .map(|tag| (*tag, FamilyProfile::builtin(*tag)))
            .collect();
        Self { profiles }
    }

    pub fn get(&self, tag: FamilyTag) -> Result<&FamilyProfile> {
        self.profiles.get(&tag).ok_or_else(|| {
            Report::new(ScheduleError::UnsupportedFamily {
                family: tag.to_string(),
            })
        })
    }

    /// Look up a family by its wire tag.
    pub fn resolve(&self, raw: &str) -> Result<&FamilyProfile> {
        let tag = raw.parse::<FamilyTag>()?;
        self.get(tag)
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
