//! The scheduling key every [`crate::node::NodeData`] carries.
//!
//! Ranks are a coarse topological index, not a dense one: `linkTo` only ever
//! raises a downstream node's rank to `upstream + 1`, it never compacts the
//! space, so ranks drift upward over a long-lived graph's lifetime. That's
//! fine — the engine only needs `downstream.rank > upstream.rank`, never a
//! specific numeric value.

/// A node's position in the engine's topological ordering.
pub type Rank = u64;

/// Sentinel rank used for listen setups with no real downstream node (a plain
/// subscriber with nothing further to feed). Always greater than any rank a
/// real node can reach, so `ensure_bigger_than` never has to bump it.
pub const NULL_RANK: Rank = u64::MAX;
