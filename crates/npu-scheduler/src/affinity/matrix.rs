//! Precomputed affinity tables.
//!
//! Rows are indexed by `requested - 1`, columns by `free_in_group - 1`.
//! Lower is better; taking exactly what a group has left scores 0.

use super::WORST_SCORE as W;

/// Family-specific lookup table of placement scores.
#[derive(Debug, PartialEq, Eq)]
pub struct AffinityMatrix {
    pub name: &'static str,
    rows: &'static [&'static [u32]],
}

impl AffinityMatrix {
    /// Score for placing `requested` devices in a group with `free` idle slots.
    ///
    /// `None` for out-of-table or sentinel cells.
    pub fn lookup(&self, requested: usize, free: usize) -> Option<u32> {
        if requested == 0 || free == 0 {
            return None;
        }
        self.rows
            .get(requested - 1)
            .and_then(|row| row.get(free - 1))
            .copied()
            .filter(|score| *score < W)
    }

    /// Largest request size the table covers.
    pub fn max_request(&self) -> usize {
        self.rows.len()
    }
}

/// Two rings of four. A single device prefers a ring with one left, then
/// three (leaving a pair), then two; three is never a legal request.
pub static RING4: AffinityMatrix = AffinityMatrix {
    name: "ring4",
    rows: &[
        &[0, 2, 1, 3],
        &[W, 0, 1, 2],
        &[W, W, W, W],
        &[W, W, W, 0],
    ],
};

/// Full mesh of eight. Staircase on waste, except single devices keep
/// odd remainders filled first so pairs stay available.
pub static MESH8: AffinityMatrix = AffinityMatrix {
    name: "mesh8",
    rows: &[
        &[0, 2, 1, 4, 3, 6, 5, 7],
        &[W, 0, 1, 2, 3, 4, 5, 6],
        &[W, W, 0, 1, 2, 3, 4, 5],
        &[W, W, W, 0, 1, 2, 3, 4],
        &[W, W, W, W, 0, 1, 2, 3],
        &[W, W, W, W, W, 0, 1, 2],
        &[W, W, W, W, W, W, 0, 1],
        &[W, W, W, W, W, W, W, 0],
    ],
};

/// Two devices per card.
pub static PAIR2: AffinityMatrix = AffinityMatrix {
    name: "pair2",
    rows: &[&[0, 1], &[W, 0]],
};
