//! Caching layer for the progression engine
//!
//! ## TTL caches
//!
//! The [`store`] module provides [`TtlCache`], the generic read cache every
//! service layers over the document store. Entries expire after a per-class
//! TTL and are invalidated explicitly by whatever mutation changes them:
//! - Memberships (5 min), invalidated on flush and daily-login claims
//! - Leaderboards and other list reads (5 min), invalidated per community
//! - Per-item reads such as transaction history (2 min)
//!
//! ## Write Buffer
//!
//! The [`write_buffer`] module accumulates XP per membership until the next
//! flush:
//! - Lock-guarded drain, no award is lost between read and clear
//! - Merge-on-requeue when a flush fails or is cancelled

pub mod keys;
pub mod store;
pub mod write_buffer;

pub use keys::MembershipKey;
pub use store::{spawn_sweep_task, CacheEntry, CacheStats, TtlCache};
pub use write_buffer::{InFlightXp, PendingXp, XpBuffer, XpBufferStats};

use std::time::Duration;

/// TTLs per cache class
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL for membership records
    pub membership_ttl: Duration,
    /// TTL for read-heavy list caches (leaderboards)
    pub list_ttl: Duration,
    /// TTL for transient per-item caches (transaction history)
    pub item_ttl: Duration,
    /// Sweep interval for expired entries
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            membership_ttl: Duration::from_secs(300), // 5 minutes
            list_ttl: Duration::from_secs(300),       // 5 minutes
            item_ttl: Duration::from_secs(120),       // 2 minutes
            sweep_interval: Duration::from_secs(60),  // Run sweep every minute
        }
    }
}
