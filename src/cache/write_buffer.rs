//! XP write buffer - per-membership accumulation of pending XP
//!
//! Absorbs rapid-fire awards (hype taps, replies, coin spends) so that each
//! membership is written at most once per flush cycle instead of once per
//! action.
//!
//! ## Lifecycle
//!
//! 1. `add` creates or grows the buffer for a key (no I/O, never fails)
//! 2. `drain_all` / `take` hand buffers to the flush path and clear them
//! 3. `requeue` merges a buffer whose flush failed back into the map
//!
//! Draining happens under the same lock as `add`, so an award is either in
//! the drained snapshot or stays in the map for the next cycle.
//!
//! The flush path checks buffers out as [`InFlightXp`] guards. A guard that
//! is dropped before `settle` requeues its XP, so a flush future that is
//! cancelled mid-write loses nothing. Totals saturate instead of overflowing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::MembershipKey;
use crate::types::SourceKind;

// =============================================================================
// Pending XP
// =============================================================================

/// XP accumulated for one membership that is not yet durable.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingXp {
    pub total_pending: i64,
    /// Contributing sources in award order (audit trail)
    pub sources: Vec<SourceKind>,
    pub last_added_at: DateTime<Utc>,
}

impl PendingXp {
    fn new(amount: i64, source: SourceKind, at: DateTime<Utc>) -> Self {
        Self {
            total_pending: amount,
            sources: vec![source],
            last_added_at: at,
        }
    }

    /// Fold a newer buffer into this one. `self` is the older snapshot, so
    /// its sources come first.
    pub fn merge(mut self, newer: PendingXp) -> Self {
        self.total_pending = self.total_pending.saturating_add(newer.total_pending);
        self.sources.extend(newer.sources);
        self.last_added_at = self.last_added_at.max(newer.last_added_at);
        self
    }

    /// Number of awards folded into this buffer
    pub fn award_count(&self) -> usize {
        self.sources.len()
    }

    pub fn first_source(&self) -> Option<SourceKind> {
        self.sources.first().copied()
    }
}

// =============================================================================
// Buffer Statistics
// =============================================================================

/// Snapshot of buffer contents
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct XpBufferStats {
    /// Memberships with pending XP
    pub pending_keys: usize,
    /// Awards waiting across all memberships
    pub pending_awards: usize,
    /// Sum of pending XP
    pub pending_xp: i64,
}

// =============================================================================
// XP Buffer
// =============================================================================

#[derive(Debug, Default)]
struct BufferState {
    buffers: HashMap<MembershipKey, PendingXp>,
    /// Running award count across all buffers
    awards: usize,
}

impl BufferState {
    fn take_all(&mut self) -> HashMap<MembershipKey, PendingXp> {
        self.awards = 0;
        std::mem::take(&mut self.buffers)
    }
}

/// In-memory accumulator of pending XP keyed by membership.
#[derive(Debug, Default)]
pub struct XpBuffer {
    state: Mutex<BufferState>,
}

impl XpBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // A poisoned lock still holds consistent data: no critical section
    // below can panic halfway through an update.
    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add XP for a membership.
    ///
    /// Returns the total number of buffered awards across all keys so the
    /// caller can apply a size-triggered flush.
    pub fn add(&self, key: &MembershipKey, amount: i64, source: SourceKind) -> usize {
        self.add_at(key, amount, source, Utc::now())
    }

    pub(crate) fn add_at(
        &self,
        key: &MembershipKey,
        amount: i64,
        source: SourceKind,
        at: DateTime<Utc>,
    ) -> usize {
        let mut state = self.lock();
        match state.buffers.get_mut(key) {
            Some(pending) => {
                pending.total_pending = pending.total_pending.saturating_add(amount);
                pending.sources.push(source);
                pending.last_added_at = at;
            }
            None => {
                state.buffers.insert(key.clone(), PendingXp::new(amount, source, at));
            }
        }
        state.awards += 1;
        state.awards
    }

    /// Remove and return every buffer, leaving the map empty.
    pub fn drain_all(&self) -> HashMap<MembershipKey, PendingXp> {
        let drained = self.lock().take_all();
        if !drained.is_empty() {
            debug!(keys = drained.len(), "Drained XP buffers");
        }
        drained
    }

    /// Remove and return the buffer for one key.
    pub fn take(&self, key: &MembershipKey) -> Option<PendingXp> {
        let mut state = self.lock();
        let pending = state.buffers.remove(key)?;
        state.awards = state.awards.saturating_sub(pending.award_count());
        Some(pending)
    }

    /// Check out one key's buffer for flushing.
    pub fn checkout(&self, key: &MembershipKey) -> Option<InFlightXp<'_>> {
        self.take(key)
            .map(|pending| InFlightXp::new(self, key.clone(), pending))
    }

    /// Check out every buffer for flushing, leaving the map empty.
    pub fn checkout_all(&self) -> Vec<InFlightXp<'_>> {
        self.drain_all()
            .into_iter()
            .map(|(key, pending)| InFlightXp::new(self, key, pending))
            .collect()
    }

    /// Put back a buffer whose flush failed.
    ///
    /// Anything awarded while the flush was in flight is merged, never
    /// overwritten.
    pub fn requeue(&self, key: MembershipKey, pending: PendingXp) {
        let mut state = self.lock();
        state.awards += pending.award_count();
        let merged = match state.buffers.remove(&key) {
            Some(newer) => pending.merge(newer),
            None => pending,
        };
        debug!(
            key = %key,
            total_pending = merged.total_pending,
            awards = merged.award_count(),
            "Requeued XP buffer"
        );
        state.buffers.insert(key, merged);
    }

    /// Pending XP for a key, without draining it.
    pub fn pending(&self, key: &MembershipKey) -> Option<PendingXp> {
        self.lock().buffers.get(key).cloned()
    }

    pub fn pending_xp(&self, key: &MembershipKey) -> i64 {
        self.lock().buffers.get(key).map_or(0, |p| p.total_pending)
    }

    fn sum_xp<'a>(pending: impl Iterator<Item = &'a PendingXp>) -> i64 {
        pending.fold(0i64, |sum, p| sum.saturating_add(p.total_pending))
    }

    /// Drop every pending buffer. Returns the amount of XP discarded.
    pub fn clear(&self) -> i64 {
        let dropped = self.lock().take_all();
        let xp = Self::sum_xp(dropped.values());
        if !dropped.is_empty() {
            warn!(keys = dropped.len(), xp = xp, "XP buffers cleared - pending XP dropped");
        }
        xp
    }

    pub fn is_empty(&self) -> bool {
        self.lock().buffers.is_empty()
    }

    pub fn stats(&self) -> XpBufferStats {
        let state = self.lock();
        XpBufferStats {
            pending_keys: state.buffers.len(),
            pending_awards: state.awards,
            pending_xp: Self::sum_xp(state.buffers.values()),
        }
    }
}

// =============================================================================
// In-flight Guard
// =============================================================================

/// A buffer checked out for flushing.
///
/// Dropping the guard without calling [`settle`](Self::settle) merges the XP
/// back into the buffer it came from.
#[derive(Debug)]
pub struct InFlightXp<'a> {
    buffer: &'a XpBuffer,
    key: MembershipKey,
    pending: Option<PendingXp>,
}

impl<'a> InFlightXp<'a> {
    fn new(buffer: &'a XpBuffer, key: MembershipKey, pending: PendingXp) -> Self {
        Self {
            buffer,
            key,
            pending: Some(pending),
        }
    }

    pub fn key(&self) -> &MembershipKey {
        &self.key
    }

    /// XP carried by this guard; zero once settled.
    pub fn total_pending(&self) -> i64 {
        self.pending.as_ref().map_or(0, |p| p.total_pending)
    }

    pub fn pending(&self) -> Option<&PendingXp> {
        self.pending.as_ref()
    }

    /// The XP reached a final state (written, or deliberately dropped).
    pub fn settle(mut self) -> Option<PendingXp> {
        self.pending.take()
    }
}

impl Drop for InFlightXp<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            self.buffer.requeue(self.key.clone(), pending);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
