use std::cmp::Reverse;

use super::{CROSS_GROUP_STEP, WORST_SCORE};
use crate::family::FamilyProfile;
use crate::topology::NodeView;
use crate::vdevice::Share;

/// How many devices to take from one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupTake {
    /// Index into [`NodeView::free_by_group`]
    pub group: usize,
    pub count: usize,
}

/// A scored whole-device placement on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub score: u32,
    pub takes: Vec<GroupTake>,
}

/// A scored virtual placement: which slot gets the lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualPlacement {
    pub slot: usize,
    pub score: u32,
}

/// Why a node cannot host a request.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum Infeasible {
    #[display("empty request")]
    EmptyRequest,
    #[display("request of {requested} exceeds node capacity {capacity}")]
    ExceedsCapacity { requested: usize, capacity: usize },
    #[display("whole-node request needs all {capacity} devices free, {free} are")]
    NodeNotEmpty { capacity: usize, free: usize },
    #[display("request of {requested} would span {group_size}-device groups")]
    SpansGroups { requested: usize, group_size: usize },
    #[display("no group has {requested} free devices")]
    NoGroupFits { requested: usize },
    #[display("only {free} devices free for a request of {requested}")]
    NotEnoughFree { requested: usize, free: usize },
    #[display("no device has {share} per-mille of room")]
    NoVirtualRoom { share: u32 },
}

/// Choose where `requested` whole devices would go on `view`.
///
/// The allocator commits exactly this placement, so a node is always
/// allocated the way it was scored. Among equal scores the lowest group wins.
pub fn place_whole(
    requested: usize,
    view: &NodeView,
    profile: &FamilyProfile,
) -> Result<Placement, Infeasible> {
    if requested == 0 {
        return Err(Infeasible::EmptyRequest);
    }
    if requested > view.capacity {
        return Err(Infeasible::ExceedsCapacity {
            requested,
            capacity: view.capacity,
        });
    }

    let free: Vec<usize> = view.free_by_group.iter().map(Vec::len).collect();
    let total_free: usize = free.iter().sum();

    if requested == view.capacity {
        if total_free != view.capacity {
            return Err(Infeasible::NodeNotEmpty {
                capacity: view.capacity,
                free: total_free,
            });
        }
        let takes = free
            .iter()
            .enumerate()
            .map(|(group, count)| GroupTake {
                group,
                count: *count,
            })
            .collect();
        return Ok(Placement { score: 0, takes });
    }

    if requested > profile.group_size {
        if !profile.allow_cross_group {
            return Err(Infeasible::SpansGroups {
                requested,
                group_size: profile.group_size,
            });
        }
        return spread(requested, &free, total_free, profile);
    }

    let within = free
        .iter()
        .enumerate()
        .filter(|(_, f)| **f >= requested)
        .filter_map(|(group, f)| {
            profile
                .matrix
                .lookup(requested, *f)
                .map(|score| (score, group))
        })
        .min()
        .map(|(score, group)| Placement {
            score,
            takes: vec![GroupTake {
                group,
                count: requested,
            }],
        });

    match within {
        Some(placement) => Ok(placement),
        // small requests still spread when every group is too fragmented
        None if profile.allow_cross_group => spread(requested, &free, total_free, profile),
        None => Err(Infeasible::NoGroupFits { requested }),
    }
}

/// Score of the best whole-device placement, `None` when infeasible.
pub fn score(requested: usize, view: &NodeView, profile: &FamilyProfile) -> Option<u32> {
    place_whole(requested, view, profile).ok().map(|p| p.score)
}

/// Cross-group placement: drain the emptiest groups first so the request
/// touches as few groups as possible, then score the partial tail group.
fn spread(
    requested: usize,
    free: &[usize],
    total_free: usize,
    profile: &FamilyProfile,
) -> Result<Placement, Infeasible> {
    if total_free < requested {
        return Err(Infeasible::NotEnoughFree {
            requested,
            free: total_free,
        });
    }

    let mut order: Vec<usize> = (0..free.len()).filter(|g| free[*g] > 0).collect();
    order.sort_by_key(|g| (Reverse(free[*g]), *g));

    let mut remaining = requested;
    let mut takes = Vec::new();
    for group in order {
        if remaining == 0 {
            break;
        }
        let count = free[group].min(remaining);
        takes.push(GroupTake { group, count });
        remaining -= count;
    }

    let tail = takes
        .last()
        .and_then(|take| profile.matrix.lookup(take.count, free[take.group]))
        .unwrap_or(0);
    let hops = u32::try_from(takes.len().saturating_sub(1)).unwrap_or(u32::MAX);
    let score = hops
        .saturating_mul(CROSS_GROUP_STEP)
        .saturating_add(tail)
        .min(WORST_SCORE - 1);

    // Keep the takes in slot order so allocation is lowest-index first.
    takes.sort_by_key(|take| take.group);
    Ok(Placement { score, takes })
}

/// Choose the slot a virtual lease of `share` would land on.
///
/// Best fit: the slot left with the least room afterwards, lowest index on
/// ties. Packing onto an already shared slot scores 0, opening a fresh one 1.
pub fn place_virtual(
    share: Share,
    exclusive: bool,
    view: &NodeView,
) -> Result<VirtualPlacement, Infeasible> {
    view.lease_room
        .iter()
        .filter(|room| room.remaining >= share.permille())
        .filter(|room| !exclusive || !room.shared)
        .min_by_key(|room| (room.remaining - share.permille(), room.slot))
        .map(|room| VirtualPlacement {
            slot: room.slot,
            score: u32::from(!room.shared),
        })
        .ok_or(Infeasible::NoVirtualRoom {
            share: share.permille(),
        })
}
