//! Document store seam
//!
//! The engine only needs read, atomic write and a direct field update from
//! the remote store. Any backend that can commit a membership together with
//! its transaction log entry in one all-or-nothing operation will do.

pub mod memory;

pub use memory::InMemoryStore;

use crate::cache::MembershipKey;
use crate::types::{DailyLoginFields, Membership, Result, XpTransaction};

/// Store operations consumed by the progression engine (allows mocking in tests)
#[async_trait::async_trait]
pub trait ProgressionStore: Send + Sync {
    /// Read a membership; `None` if the user is not a member of the community
    async fn get_membership(&self, key: &MembershipKey) -> Result<Option<Membership>>;

    /// Write the membership and its transaction log entry atomically
    ///
    /// Fails with `NotMember` for an unknown key and `InvalidAmount` for a
    /// transaction that does not add XP.
    async fn atomic_write(&self, membership: &Membership, transaction: &XpTransaction) -> Result<()>;

    /// Update the daily-login fields of an existing membership
    async fn update_fields(&self, key: &MembershipKey, fields: &DailyLoginFields) -> Result<()>;

    /// All memberships of a community (leaderboards)
    async fn list_memberships(&self, community_id: &str) -> Result<Vec<Membership>>;

    /// Most recent transactions for a membership, newest first
    async fn list_transactions(&self, key: &MembershipKey, limit: usize) -> Result<Vec<XpTransaction>>;
}
