//! Progression - buffered XP, leveling and badges for community memberships
//!
//! Awards are accumulated in memory and written to the document store in
//! batches. Each flush recomputes the membership's level from a precomputed
//! level table, unlocks any badges crossed on the way, and commits the
//! membership together with an audit transaction in one atomic write.

pub mod cache;
pub mod config;
pub mod leveling;
pub mod services;
pub mod store;
pub mod types;

pub use cache::{CacheConfig, MembershipKey};
pub use config::{Args, ProgressionConfig};
pub use leveling::{BadgeCatalog, BadgeDefinition, LevelTable};
pub use services::{FlushReport, FlushScheduler, ProgressionEngine};
pub use store::{InMemoryStore, ProgressionStore};
pub use types::{ProgressionError, Result};
