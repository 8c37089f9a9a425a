//! Configuration for the progression engine
//!
//! CLI arguments and environment variable handling using clap.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use tracing::warn;

use crate::cache::CacheConfig;
use crate::leveling::LevelTable;
use crate::services::{EngineConfig, SchedulerConfig};
use crate::types::{Membership, ProgressionError, Result};

/// Progression - buffered XP, levels and badges for community memberships
#[derive(Parser, Debug, Clone)]
#[command(name = "progression")]
#[command(about = "Buffered XP, leveling and badge engine")]
pub struct Args {
    /// Seconds between periodic flushes
    #[arg(long, env = "FLUSH_INTERVAL_SECS", default_value = "30")]
    pub flush_interval_secs: u64,

    /// Buffered award count that triggers an early flush
    #[arg(long, env = "FLUSH_THRESHOLD", default_value = "50")]
    pub flush_threshold: usize,

    /// Timeout for a single store call in milliseconds
    #[arg(long, env = "STORE_TIMEOUT_MS", default_value = "5000")]
    pub store_timeout_ms: u64,

    /// Timeout for the final flush at logout in milliseconds
    #[arg(long, env = "LOGOUT_TIMEOUT_MS", default_value = "3000")]
    pub logout_timeout_ms: u64,

    /// Cap on the daily-login streak bonus
    #[arg(long, env = "MAX_STREAK_BONUS", default_value = "15")]
    pub max_streak_bonus: u32,

    /// Cache configuration
    #[command(flatten)]
    pub cache: CacheArgs,

    /// JSON file with memberships to seed the in-memory store
    #[arg(long, env = "SEED_FILE")]
    pub seed_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

/// Cache TTLs
#[derive(Parser, Debug, Clone)]
pub struct CacheArgs {
    /// Membership cache TTL in seconds
    #[arg(long, env = "CACHE_MEMBERSHIP_TTL_SECS", default_value = "300")]
    pub membership_ttl_secs: u64,

    /// Leaderboard cache TTL in seconds
    #[arg(long, env = "CACHE_LIST_TTL_SECS", default_value = "300")]
    pub list_ttl_secs: u64,

    /// Transaction history cache TTL in seconds
    #[arg(long, env = "CACHE_ITEM_TTL_SECS", default_value = "120")]
    pub item_ttl_secs: u64,

    /// Seconds between expired-entry sweeps
    #[arg(long, env = "CACHE_SWEEP_INTERVAL_SECS", default_value = "60")]
    pub sweep_interval_secs: u64,
}

/// Everything the library needs to build an engine and its scheduler
#[derive(Debug, Clone, Default)]
pub struct ProgressionConfig {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        let nonzero = [
            ("FLUSH_INTERVAL_SECS", self.flush_interval_secs),
            ("FLUSH_THRESHOLD", self.flush_threshold as u64),
            ("STORE_TIMEOUT_MS", self.store_timeout_ms),
            ("LOGOUT_TIMEOUT_MS", self.logout_timeout_ms),
            ("CACHE_MEMBERSHIP_TTL_SECS", self.cache.membership_ttl_secs),
            ("CACHE_LIST_TTL_SECS", self.cache.list_ttl_secs),
            ("CACHE_ITEM_TTL_SECS", self.cache.item_ttl_secs),
            ("CACHE_SWEEP_INTERVAL_SECS", self.cache.sweep_interval_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(format!("{} must be greater than zero", name));
        }

        Ok(())
    }

    pub fn progression_config(&self) -> ProgressionConfig {
        ProgressionConfig {
            engine: EngineConfig {
                flush_threshold: self.flush_threshold,
                store_timeout: Duration::from_millis(self.store_timeout_ms),
                max_streak_bonus: self.max_streak_bonus,
                ..Default::default()
            },
            scheduler: SchedulerConfig {
                flush_interval: Duration::from_secs(self.flush_interval_secs),
                logout_timeout: Duration::from_millis(self.logout_timeout_ms),
            },
            cache: CacheConfig {
                membership_ttl: Duration::from_secs(self.cache.membership_ttl_secs),
                list_ttl: Duration::from_secs(self.cache.list_ttl_secs),
                item_ttl: Duration::from_secs(self.cache.item_ttl_secs),
                sweep_interval: Duration::from_secs(self.cache.sweep_interval_secs),
            },
        }
    }
}

/// Load a JSON array of memberships.
///
/// Negative XP is rejected. A stored level that disagrees with the level
/// table is replaced by the level the XP implies.
pub fn load_seed(path: &Path) -> Result<Vec<Membership>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ProgressionError::Config(format!("{}: {}", path.display(), e)))?;
    let mut memberships: Vec<Membership> = serde_json::from_str(&raw)?;

    let table = LevelTable::new();
    for membership in &mut memberships {
        if membership.xp < 0 {
            return Err(ProgressionError::Config(format!(
                "{}: membership {} has negative xp {}",
                path.display(),
                membership.key(),
                membership.xp
            )));
        }

        let level = table.level_from_xp(membership.xp);
        if membership.level != level {
            warn!(
                key = %membership.key(),
                xp = membership.xp,
                seeded_level = membership.level,
                level = level,
                "Seed level disagrees with xp, normalizing"
            );
            membership.level = level;
        }
    }

    Ok(memberships)
}
