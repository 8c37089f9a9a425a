//! In-memory document store
//!
//! Backs the runner binary and the test suite. Membership and transaction
//! log share one lock so `atomic_write` is all-or-nothing. Faults can be
//! injected to exercise the requeue path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use super::ProgressionStore;
use crate::cache::MembershipKey;
use crate::types::{DailyLoginFields, Membership, ProgressionError, Result, XpTransaction};

#[derive(Default)]
struct StoreState {
    memberships: HashMap<MembershipKey, Membership>,
    /// Per-membership log, oldest first
    transactions: HashMap<MembershipKey, Vec<XpTransaction>>,
}

/// Simple in-memory store with fault injection
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    unavailable: AtomicBool,
    fail_writes: AtomicU32,
    conflict_writes: AtomicU32,
    latency_ms: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with memberships
    pub fn with_memberships(memberships: impl IntoIterator<Item = Membership>) -> Self {
        let state = StoreState {
            memberships: memberships.into_iter().map(|m| (m.key(), m)).collect(),
            transactions: HashMap::new(),
        };
        Self {
            state: RwLock::new(state),
            ..Default::default()
        }
    }

    /// Insert or replace a membership directly
    pub async fn insert_membership(&self, membership: Membership) {
        self.state
            .write()
            .await
            .memberships
            .insert(membership.key(), membership);
    }

    /// Read a membership, bypassing faults and counters
    pub async fn snapshot(&self, key: &MembershipKey) -> Option<Membership> {
        self.state.read().await.memberships.get(key).cloned()
    }

    /// Full transaction log for a membership, oldest first
    pub async fn transaction_log(&self, key: &MembershipKey) -> Vec<XpTransaction> {
        self.state
            .read()
            .await
            .transactions
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every call fail with `StoreUnavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail the next `n` atomic writes with `StoreUnavailable`
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` atomic writes with `TransactionConflict`
    pub fn conflict_next_writes(&self, n: u32) {
        self.conflict_writes.store(n, Ordering::SeqCst);
    }

    /// Delay every call, to exercise store timeouts
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of store reads served
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of committed writes (atomic writes and field updates)
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> Result<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ProgressionError::StoreUnavailable("store offline".into()));
        }
        Ok(())
    }

    fn consume(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl ProgressionStore for InMemoryStore {
    async fn get_membership(&self, key: &MembershipKey) -> Result<Option<Membership>> {
        self.simulate_call().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.read().await.memberships.get(key).cloned())
    }

    async fn atomic_write(&self, membership: &Membership, transaction: &XpTransaction) -> Result<()> {
        self.simulate_call().await?;

        if Self::consume(&self.fail_writes) {
            return Err(ProgressionError::StoreUnavailable("injected write failure".into()));
        }
        if Self::consume(&self.conflict_writes) {
            return Err(ProgressionError::TransactionConflict("injected conflict".into()));
        }

        if transaction.amount <= 0 {
            return Err(ProgressionError::InvalidAmount(transaction.amount));
        }

        let key = membership.key();
        let mut state = self.state.write().await;
        if !state.memberships.contains_key(&key) {
            return Err(ProgressionError::NotMember(key));
        }
        state.memberships.insert(key.clone(), membership.clone());
        state
            .transactions
            .entry(key.clone())
            .or_default()
            .push(transaction.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);

        debug!(
            document = %key.document_id(),
            xp = membership.xp,
            level = membership.level,
            "Membership committed"
        );
        Ok(())
    }

    async fn update_fields(&self, key: &MembershipKey, fields: &DailyLoginFields) -> Result<()> {
        self.simulate_call().await?;

        let mut state = self.state.write().await;
        let membership = state
            .memberships
            .get_mut(key)
            .ok_or_else(|| ProgressionError::NotMember(key.clone()))?;
        membership.daily_login_streak = fields.daily_login_streak;
        membership.last_daily_login_at = Some(fields.last_daily_login_at);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_memberships(&self, community_id: &str) -> Result<Vec<Membership>> {
        self.simulate_call().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .read()
            .await
            .memberships
            .values()
            .filter(|m| m.community_id == community_id)
            .cloned()
            .collect())
    }

    async fn list_transactions(&self, key: &MembershipKey, limit: usize) -> Result<Vec<XpTransaction>> {
        self.simulate_call().await?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(key)
            .map(|log| log.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}
