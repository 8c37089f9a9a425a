//! Progression Engine - buffered XP intake, flushing and level/badge evaluation
//!
//! ## Flow
//!
//! 1. `award_xp` adds to the [`XpBuffer`] (no I/O, cannot fail)
//! 2. A flush drains the buffer, reads the durable membership, merges the
//!    delta, recomputes level and badges, then commits membership and
//!    transaction log in one atomic store call
//! 3. On success dependent caches are invalidated and level-up / badge
//!    events are broadcast; on a transient failure the drained buffer is
//!    requeued for the next cycle
//!
//! Flushes of the same membership are serialized by a per-key lock; different
//! memberships flush concurrently and fail independently.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{
    spawn_sweep_task, CacheConfig, CacheStats, InFlightXp, MembershipKey, PendingXp, TtlCache,
    XpBuffer, XpBufferStats,
};
use crate::leveling::{BadgeCatalog, BadgeDefinition, LevelTable};
use crate::store::ProgressionStore;
use crate::types::{
    BadgeEligibility, BadgeUnlockEvent, DailyLoginFields, DailyLoginResult, LevelUpEvent,
    Membership, ProgressionError, ProjectedProgress, Result, SourceKind, XpTransaction,
};

/// Transactions kept per membership in the history cache
const HISTORY_WINDOW: usize = 50;

/// Ceiling on a single award after the multiplier is applied
pub const MAX_AWARD_XP: i64 = 1_000_000;

// =============================================================================
// Engine Configuration
// =============================================================================

/// Configuration for the progression engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Buffered award count that requests an early flush
    pub flush_threshold: usize,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
    /// Cap on the streak bonus added to the daily-login reward
    pub max_streak_bonus: u32,
    /// Capacity of each event broadcast channel
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_threshold: 50,
            store_timeout: Duration::from_secs(5),
            max_streak_bonus: 15,
            event_capacity: 256,
        }
    }
}

// =============================================================================
// Flush Results
// =============================================================================

/// Result of committing one membership's buffer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushOutcome {
    pub key: MembershipKey,
    pub xp_committed: i64,
    pub new_total_xp: i64,
    pub old_level: u32,
    pub new_level: u32,
    pub leveled_up: bool,
    pub new_badges: Vec<BadgeDefinition>,
    pub transaction_id: String,
}

/// Result of a `flush_all` pass
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushReport {
    /// Memberships committed
    pub committed: u64,
    /// Memberships requeued after a transient failure
    pub requeued: u64,
    /// Memberships whose buffer was dropped (not a member)
    pub dropped: u64,
    /// XP made durable
    pub xp_committed: i64,
    pub level_ups: u64,
    /// Duration in milliseconds
    pub duration_ms: f64,
}

/// Snapshot of engine buffers and caches
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub buffer: XpBufferStats,
    pub memberships: CacheStats,
    pub leaderboards: CacheStats,
    pub histories: CacheStats,
}

// =============================================================================
// Progression Engine
// =============================================================================

/// Orchestrates award intake, buffering, flushing and cache coherence.
pub struct ProgressionEngine<S: ProgressionStore> {
    store: Arc<S>,
    config: EngineConfig,
    cache_config: CacheConfig,
    levels: LevelTable,
    badges: BadgeCatalog,
    buffer: XpBuffer,
    memberships: Arc<TtlCache<MembershipKey, Membership>>,
    /// Community id -> memberships ordered by XP
    leaderboards: Arc<TtlCache<String, Vec<Membership>>>,
    /// Recent transactions, newest first
    histories: Arc<TtlCache<MembershipKey, Vec<XpTransaction>>>,
    /// Serializes flushes and claims per membership
    key_locks: DashMap<MembershipKey, Arc<Mutex<()>>>,
    flush_signal: Notify,
    level_up_tx: broadcast::Sender<LevelUpEvent>,
    badge_tx: broadcast::Sender<BadgeUnlockEvent>,
}

impl<S: ProgressionStore> ProgressionEngine<S> {
    /// Create a new engine over the given store.
    pub fn new(store: Arc<S>, config: EngineConfig, cache_config: CacheConfig) -> Self {
        let (level_up_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (badge_tx, _) = broadcast::channel(config.event_capacity.max(1));

        info!(
            flush_threshold = config.flush_threshold,
            store_timeout_ms = config.store_timeout.as_millis() as u64,
            membership_ttl_secs = cache_config.membership_ttl.as_secs(),
            "ProgressionEngine initialized"
        );

        Self {
            store,
            config,
            cache_config,
            levels: LevelTable::new(),
            badges: BadgeCatalog::standard(),
            buffer: XpBuffer::new(),
            memberships: Arc::new(TtlCache::new("memberships")),
            leaderboards: Arc::new(TtlCache::new("leaderboards")),
            histories: Arc::new(TtlCache::new("histories")),
            key_locks: DashMap::new(),
            flush_signal: Notify::new(),
            level_up_tx,
            badge_tx,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, EngineConfig::default(), CacheConfig::default())
    }

    /// Replace the standard badge catalog.
    pub fn with_badges(mut self, badges: BadgeCatalog) -> Self {
        self.badges = badges;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn level_table(&self) -> &LevelTable {
        &self.levels
    }

    pub fn badge_catalog(&self) -> &BadgeCatalog {
        &self.badges
    }

    // =========================================================================
    // Award Intake
    // =========================================================================

    /// Buffer the base XP of `source` for a membership.
    pub fn award_xp(&self, key: &MembershipKey, source: SourceKind) {
        self.award_xp_with_multiplier(key, source, 1.0);
    }

    /// Buffer `floor(base_xp * multiplier)`, capped at [`MAX_AWARD_XP`].
    /// Non-positive and NaN amounts are ignored.
    pub fn award_xp_with_multiplier(&self, key: &MembershipKey, source: SourceKind, multiplier: f64) {
        let amount = (source.base_xp() as f64 * multiplier).floor();
        if amount.is_nan() || amount < 1.0 {
            debug!(key = %key, source = %source, multiplier = multiplier, "Non-positive award ignored");
            return;
        }
        if amount > MAX_AWARD_XP as f64 {
            warn!(key = %key, source = %source, multiplier = multiplier, cap = MAX_AWARD_XP, "Award capped");
        }
        self.buffer_award(key, amount.min(MAX_AWARD_XP as f64) as i64, source);
    }

    fn buffer_award(&self, key: &MembershipKey, amount: i64, source: SourceKind) {
        let buffered = self.buffer.add(key, amount, source);
        debug!(key = %key, source = %source, amount = amount, buffered = buffered, "XP buffered");

        if buffered >= self.config.flush_threshold {
            self.flush_signal.notify_one();
        }
    }

    /// Resolves once buffered awards reach the flush threshold.
    pub async fn flush_requested(&self) {
        self.flush_signal.notified().await;
    }

    /// XP buffered for a membership but not yet durable.
    pub fn pending_xp(&self, key: &MembershipKey) -> i64 {
        self.buffer.pending_xp(key)
    }

    pub fn pending(&self, key: &MembershipKey) -> Option<PendingXp> {
        self.buffer.pending(key)
    }

    /// Drop every pending buffer. Returns the XP discarded.
    pub fn discard_pending(&self) -> i64 {
        self.buffer.clear()
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Flush one membership's buffer. `Ok(None)` if nothing was pending.
    pub async fn flush(&self, key: &MembershipKey) -> Result<Option<FlushOutcome>> {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            match self.buffer.checkout(key) {
                Some(in_flight) => self.commit(in_flight).await.map(Some),
                None => Ok(None),
            }
        };
        drop(lock);
        self.release_key_lock(key);
        result
    }

    /// Drain every buffer and flush each membership concurrently.
    ///
    /// A failure for one membership never blocks the others.
    pub async fn flush_all(&self) -> FlushReport {
        let start = Instant::now();
        // Guards are created before any await so cancellation requeues them
        let checked_out = self.buffer.checkout_all();
        if checked_out.is_empty() {
            return FlushReport::default();
        }

        let results = join_all(
            checked_out
                .into_iter()
                .map(|in_flight| self.flush_checked_out(in_flight)),
        )
        .await;

        let mut report = FlushReport::default();
        for result in results {
            match result {
                Ok(outcome) => {
                    report.committed += 1;
                    report.xp_committed = report.xp_committed.saturating_add(outcome.xp_committed);
                    if outcome.leveled_up {
                        report.level_ups += 1;
                    }
                }
                Err(e) if e.is_transient() => report.requeued += 1,
                Err(_) => report.dropped += 1,
            }
        }
        report.duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        info!(
            committed = report.committed,
            requeued = report.requeued,
            dropped = report.dropped,
            xp = report.xp_committed,
            level_ups = report.level_ups,
            duration_ms = report.duration_ms,
            "Flush all completed"
        );
        report
    }

    async fn flush_checked_out(&self, in_flight: InFlightXp<'_>) -> Result<FlushOutcome> {
        let key = in_flight.key().clone();
        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.commit(in_flight).await
        };
        drop(lock);
        self.release_key_lock(&key);
        result
    }

    /// Write a checked-out buffer. Transient failures (and cancellation)
    /// drop the guard, which requeues the XP.
    async fn commit(&self, in_flight: InFlightXp<'_>) -> Result<FlushOutcome> {
        let Some(pending) = in_flight.pending() else {
            return Err(ProgressionError::Internal("buffer already settled".into()));
        };
        let key = in_flight.key();

        match self.write_pending(key, pending).await {
            Ok(outcome) => {
                in_flight.settle();
                self.after_commit(&outcome);
                Ok(outcome)
            }
            Err(e) if e.is_transient() => {
                warn!(
                    key = %key,
                    xp = pending.total_pending,
                    error = %e,
                    kind = e.kind(),
                    "Flush failed, requeuing buffer"
                );
                drop(in_flight);
                Err(e)
            }
            Err(e) => {
                error!(
                    key = %key,
                    xp = pending.total_pending,
                    sources = pending.award_count(),
                    error = %e,
                    kind = e.kind(),
                    "Flush failed permanently, buffer dropped"
                );
                in_flight.settle();
                Err(e)
            }
        }
    }

    async fn write_pending(&self, key: &MembershipKey, pending: &PendingXp) -> Result<FlushOutcome> {
        let current = self
            .with_timeout("get_membership", self.store.get_membership(key))
            .await?
            .ok_or_else(|| ProgressionError::NotMember(key.clone()))?;

        let (updated, transaction, new_badges) = self.apply_pending(&current, pending, Utc::now());

        self.with_timeout("atomic_write", self.store.atomic_write(&updated, &transaction))
            .await?;

        Ok(FlushOutcome {
            key: key.clone(),
            xp_committed: pending.total_pending,
            new_total_xp: updated.xp,
            old_level: current.level,
            new_level: updated.level,
            leveled_up: transaction.leveled_up,
            new_badges,
            transaction_id: transaction.id,
        })
    }

    /// Merge a pending delta into a membership. Pure; no I/O.
    pub fn apply_pending(
        &self,
        current: &Membership,
        pending: &PendingXp,
        now: DateTime<Utc>,
    ) -> (Membership, XpTransaction, Vec<BadgeDefinition>) {
        let new_xp = current.xp.saturating_add(pending.total_pending);
        let new_level = self.levels.level_from_xp(new_xp);
        let leveled_up = new_level > current.level;

        let new_badges: Vec<BadgeDefinition> = self
            .badges
            .newly_earned(new_level, &current.earned_badge_ids)
            .cloned()
            .collect();

        let mut updated = current.clone();
        updated.xp = new_xp;
        updated.level = new_level;
        updated
            .earned_badge_ids
            .extend(new_badges.iter().map(|b| b.id.clone()));

        let transaction = XpTransaction {
            id: Uuid::new_v4().to_string(),
            community_id: current.community_id.clone(),
            user_id: current.user_id.clone(),
            source: pending.first_source().unwrap_or(SourceKind::TextPost),
            sources: pending.sources.clone(),
            amount: pending.total_pending,
            new_total_xp: new_xp,
            new_level,
            leveled_up,
            badge_unlocked: new_badges.last().map(|b| b.id.clone()),
            created_at: now,
        };

        (updated, transaction, new_badges)
    }

    fn after_commit(&self, outcome: &FlushOutcome) {
        let key = &outcome.key;
        self.memberships.invalidate(key);
        self.histories.invalidate(key);
        self.leaderboards.invalidate(&key.community_id);

        debug!(
            key = %key,
            xp = outcome.xp_committed,
            total = outcome.new_total_xp,
            level = outcome.new_level,
            "Membership flushed"
        );

        let now = Utc::now();
        if outcome.leveled_up {
            info!(
                key = %key,
                old_level = outcome.old_level,
                new_level = outcome.new_level,
                "Level up"
            );
            // No subscribers is fine
            let _ = self.level_up_tx.send(LevelUpEvent {
                user_id: key.user_id.clone(),
                community_id: key.community_id.clone(),
                old_level: outcome.old_level,
                new_level: outcome.new_level,
                timestamp: now,
            });
        }

        for badge in &outcome.new_badges {
            info!(key = %key, badge = %badge.id, "Badge unlocked");
            let _ = self.badge_tx.send(BadgeUnlockEvent {
                user_id: key.user_id.clone(),
                community_id: key.community_id.clone(),
                badge: badge.clone(),
                timestamp: now,
            });
        }
    }

    // =========================================================================
    // Daily Login
    // =========================================================================

    /// Claim today's login reward.
    pub async fn claim_daily_login(&self, key: &MembershipKey) -> Result<DailyLoginResult> {
        self.claim_daily_login_at(key, Utc::now()).await
    }

    /// Claim the login reward as of `now`. Calendar days are UTC.
    pub async fn claim_daily_login_at(
        &self,
        key: &MembershipKey,
        now: DateTime<Utc>,
    ) -> Result<DailyLoginResult> {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.claim_locked(key, now).await
        };
        drop(lock);
        self.release_key_lock(key);

        if let Err(ref e) = result {
            warn!(key = %key, error = %e, kind = e.kind(), "Daily login claim failed");
        }
        result
    }

    async fn claim_locked(&self, key: &MembershipKey, now: DateTime<Utc>) -> Result<DailyLoginResult> {
        let membership = self
            .with_timeout("get_membership", self.store.get_membership(key))
            .await?
            .ok_or_else(|| ProgressionError::NotMember(key.clone()))?;

        let today = now.date_naive();
        let last_day = membership.last_daily_login_at.map(|at| at.date_naive());

        if last_day.is_some_and(|day| day >= today) {
            debug!(key = %key, "Daily login already claimed");
            return Ok(DailyLoginResult {
                awarded: false,
                xp_amount: 0,
                streak: membership.daily_login_streak,
                message: "Daily reward already claimed today".to_string(),
            });
        }

        let streak = match last_day {
            Some(day) if today.pred_opt() == Some(day) => membership.daily_login_streak + 1,
            _ => 1,
        };
        let xp_amount =
            SourceKind::DailyLogin.base_xp() + i64::from(streak.min(self.config.max_streak_bonus));

        let fields = DailyLoginFields {
            daily_login_streak: streak,
            last_daily_login_at: now,
        };
        self.with_timeout("update_fields", self.store.update_fields(key, &fields))
            .await?;
        self.memberships.invalidate(key);

        self.buffer_award(key, xp_amount, SourceKind::DailyLogin);

        info!(key = %key, streak = streak, xp = xp_amount, "Daily login claimed");
        Ok(DailyLoginResult {
            awarded: true,
            xp_amount,
            streak,
            message: format!("Day {} streak! +{} XP", streak, xp_amount),
        })
    }

    // =========================================================================
    // Cached Reads
    // =========================================================================

    /// Durable membership, served from cache when fresh.
    pub async fn membership(&self, key: &MembershipKey) -> Result<Option<Membership>> {
        if let Some(cached) = self.memberships.get(key) {
            return Ok(Some(cached));
        }

        let fetched = self
            .with_timeout("get_membership", self.store.get_membership(key))
            .await?;
        if let Some(ref membership) = fetched {
            self.memberships
                .put(key.clone(), membership.clone(), self.cache_config.membership_ttl);
        }
        Ok(fetched)
    }

    /// Top memberships of a community by durable XP.
    pub async fn leaderboard(&self, community_id: &str, limit: usize) -> Result<Vec<Membership>> {
        let community = community_id.to_string();
        let ranked = match self.leaderboards.get(&community) {
            Some(cached) => cached,
            None => {
                let mut members = self
                    .with_timeout("list_memberships", self.store.list_memberships(community_id))
                    .await?;
                members.sort_by(|a, b| b.xp.cmp(&a.xp).then_with(|| a.user_id.cmp(&b.user_id)));
                self.leaderboards
                    .put(community, members.clone(), self.cache_config.list_ttl);
                members
            }
        };
        Ok(ranked.into_iter().take(limit).collect())
    }

    /// Most recent transactions for a membership, newest first.
    pub async fn recent_transactions(
        &self,
        key: &MembershipKey,
        limit: usize,
    ) -> Result<Vec<XpTransaction>> {
        let history = match self.histories.get(key) {
            Some(cached) => cached,
            None => {
                let fetched = self
                    .with_timeout(
                        "list_transactions",
                        self.store.list_transactions(key, HISTORY_WINDOW),
                    )
                    .await?;
                self.histories
                    .put(key.clone(), fetched.clone(), self.cache_config.item_ttl);
                fetched
            }
        };
        Ok(history.into_iter().take(limit).collect())
    }

    /// Level, progress and badge status including XP still in the buffer.
    pub async fn projected_progress(&self, key: &MembershipKey) -> Result<ProjectedProgress> {
        let membership = self
            .membership(key)
            .await?
            .ok_or_else(|| ProgressionError::NotMember(key.clone()))?;

        let pending_xp = self.buffer.pending_xp(key);
        let projected_xp = membership.xp.saturating_add(pending_xp);
        let projected_level = self.levels.level_from_xp(projected_xp);

        Ok(ProjectedProgress {
            durable_xp: membership.xp,
            pending_xp,
            projected_xp,
            durable_level: membership.level,
            projected_level,
            progress_to_next: self.levels.progress_to_next_level(projected_xp),
            xp_to_next_level: self.levels.xp_to_next_level(projected_xp),
            badges: self
                .badges
                .check_eligibility(projected_level, &membership.earned_badge_ids),
        })
    }

    // =========================================================================
    // Pure Lookups
    // =========================================================================

    pub fn level_from_xp(&self, xp: i64) -> u32 {
        self.levels.level_from_xp(xp)
    }

    pub fn progress_to_next(&self, xp: i64) -> f64 {
        self.levels.progress_to_next_level(xp)
    }

    pub fn check_badge_eligibility(
        &self,
        level: u32,
        earned: &BTreeSet<String>,
    ) -> BadgeEligibility {
        self.badges.check_eligibility(level, earned)
    }

    // =========================================================================
    // Events
    // =========================================================================

    pub fn subscribe_level_ups(&self) -> broadcast::Receiver<LevelUpEvent> {
        self.level_up_tx.subscribe()
    }

    pub fn subscribe_badge_unlocks(&self) -> broadcast::Receiver<BadgeUnlockEvent> {
        self.badge_tx.subscribe()
    }

    // =========================================================================
    // Lifecycle and Statistics
    // =========================================================================

    /// Spawn the periodic sweep for every cache the engine owns.
    pub fn spawn_sweep_tasks(&self) -> Vec<JoinHandle<()>> {
        let interval = self.cache_config.sweep_interval;
        vec![
            spawn_sweep_task(Arc::clone(&self.memberships), interval),
            spawn_sweep_task(Arc::clone(&self.leaderboards), interval),
            spawn_sweep_task(Arc::clone(&self.histories), interval),
        ]
    }

    /// Drop every cached read touching a community, e.g. after its
    /// membership list changed outside the engine.
    pub fn invalidate_community(&self, community_id: &str) -> usize {
        let mut removed = self
            .memberships
            .invalidate_where(|key| key.in_community(community_id));
        removed += self
            .histories
            .invalidate_where(|key| key.in_community(community_id));
        if self.leaderboards.invalidate(&community_id.to_string()) {
            removed += 1;
        }
        debug!(community = community_id, removed = removed, "Community caches invalidated");
        removed
    }

    /// Clear every cache (session teardown).
    pub fn shutdown(&self) {
        self.memberships.clear();
        self.leaderboards.clear();
        self.histories.clear();
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            buffer: self.buffer.stats(),
            memberships: self.memberships.stats(),
            leaderboards: self.leaderboards.stats(),
            histories: self.histories.stats(),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn with_timeout<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.config.store_timeout, call)
            .await
            .map_err(|_| ProgressionError::Timeout(op))?
    }

    fn key_lock(&self, key: &MembershipKey) -> Arc<Mutex<()>> {
        Arc::clone(self.key_locks.entry(key.clone()).or_default().value())
    }

    /// Drop the lock entry once nobody else holds a handle to it.
    fn release_key_lock(&self, key: &MembershipKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// =============================================================================
// Tests
// =============================================================================
