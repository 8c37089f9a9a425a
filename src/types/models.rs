//! Durable records, XP sources and engine events

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::MembershipKey;
use crate::leveling::{BadgeDefinition, MIN_LEVEL};

// =============================================================================
// XP Sources
// =============================================================================

/// User actions that earn XP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceKind {
    TextPost,
    VideoPost,
    Reply,
    Hype,
    CoinSpend,
    DailyLogin,
    Referral,
}

impl SourceKind {
    /// XP granted for one action before any multiplier
    pub fn base_xp(&self) -> i64 {
        match self {
            SourceKind::TextPost => 10,
            SourceKind::VideoPost => 25,
            SourceKind::Reply => 5,
            SourceKind::Hype => 1,
            SourceKind::CoinSpend => 2,
            SourceKind::DailyLogin => 20,
            SourceKind::Referral => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::TextPost => "textPost",
            SourceKind::VideoPost => "videoPost",
            SourceKind::Reply => "reply",
            SourceKind::Hype => "hype",
            SourceKind::CoinSpend => "coinSpend",
            SourceKind::DailyLogin => "dailyLogin",
            SourceKind::Referral => "referral",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Membership
// =============================================================================

/// Durable progression state for one user in one community.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub user_id: String,
    pub community_id: String,
    pub xp: i64,
    pub level: u32,
    #[serde(default)]
    pub earned_badge_ids: BTreeSet<String>,
    #[serde(default)]
    pub daily_login_streak: u32,
    #[serde(default)]
    pub last_daily_login_at: Option<DateTime<Utc>>,
}

impl Membership {
    /// A fresh membership at level 1 with no XP.
    pub fn new(user_id: impl Into<String>, community_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            community_id: community_id.into(),
            xp: 0,
            level: MIN_LEVEL,
            earned_badge_ids: BTreeSet::new(),
            daily_login_streak: 0,
            last_daily_login_at: None,
        }
    }

    pub fn key(&self) -> MembershipKey {
        MembershipKey::new(&self.user_id, &self.community_id)
    }
}

/// Fields written directly (unbuffered) by a daily-login claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLoginFields {
    pub daily_login_streak: u32,
    pub last_daily_login_at: DateTime<Utc>,
}

// =============================================================================
// Transaction Log
// =============================================================================

/// Append-only log entry written atomically with each flushed membership.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XpTransaction {
    pub id: String,
    pub community_id: String,
    pub user_id: String,
    /// First source in the flushed buffer
    pub source: SourceKind,
    /// Every contributing source, in award order
    pub sources: Vec<SourceKind>,
    pub amount: i64,
    pub new_total_xp: i64,
    pub new_level: u32,
    pub leveled_up: bool,
    /// Highest badge newly earned by this flush
    pub badge_unlocked: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Events
// =============================================================================

/// Published after a flush moves a membership to a higher level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelUpEvent {
    pub user_id: String,
    pub community_id: String,
    pub old_level: u32,
    pub new_level: u32,
    pub timestamp: DateTime<Utc>,
}

/// Published once per badge a flush unlocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeUnlockEvent {
    pub user_id: String,
    pub community_id: String,
    pub badge: BadgeDefinition,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Caller-facing results
// =============================================================================

/// Outcome of a daily-login claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyLoginResult {
    pub awarded: bool,
    pub xp_amount: i64,
    pub streak: u32,
    pub message: String,
}

/// Badge status for a level and an already-earned set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeEligibility {
    pub newly_eligible: Vec<BadgeDefinition>,
    pub next_badge: Option<BadgeDefinition>,
    pub levels_to_next: Option<u32>,
}

/// Progress computed from durable plus buffered XP, without writing anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectedProgress {
    pub durable_xp: i64,
    pub pending_xp: i64,
    pub projected_xp: i64,
    pub durable_level: u32,
    pub projected_level: u32,
    pub progress_to_next: f64,
    pub xp_to_next_level: i64,
    pub badges: BadgeEligibility,
}
