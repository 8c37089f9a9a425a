//! Leveling math: the XP curve, its lookup table and the badge catalog.
//!
//! Everything here is pure, so it can be evaluated against buffered state
//! without touching the store.

pub mod badges;
pub mod curve;

pub use badges::{BadgeCatalog, BadgeDefinition};
pub use curve::{xp_required, LevelTable};

/// Starting level of every membership
pub const MIN_LEVEL: u32 = 1;

/// Level cap; XP keeps accumulating past it
pub const MAX_LEVEL: u32 = 1000;
