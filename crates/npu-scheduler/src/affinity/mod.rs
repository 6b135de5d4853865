//! Topology affinity scoring.
//!
//! Scores are communication-locality costs: lower is better, `0` means the
//! request fits its group exactly, [`WORST_SCORE`] marks an infeasible
//! placement that callers must reject.

pub mod matrix;
mod scorer;

pub use scorer::place_virtual;
pub use scorer::place_whole;
pub use scorer::score;
pub use scorer::GroupTake;
pub use scorer::Infeasible;
pub use scorer::Placement;
pub use scorer::VirtualPlacement;

/// Sentinel for infeasible placements. Feasible scores stay strictly below it.
pub const WORST_SCORE: u32 = 64;

/// Extra cost per additional group a cross-group placement touches.
pub const CROSS_GROUP_STEP: u32 = 2;
