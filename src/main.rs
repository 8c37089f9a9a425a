//! Progression runner
//!
//! Drives one engine session over an in-memory store. Commands arrive as
//! newline-delimited JSON on stdin, results are written as JSON lines on
//! stdout and logs go to stderr. EOF or Ctrl-C performs the logout flush.

use std::sync::Arc;

use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use progression::{
    config::{load_seed, Args},
    types::{Membership, SourceKind},
    FlushScheduler, InMemoryStore, MembershipKey, ProgressionEngine,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum Command {
    #[serde(rename_all = "camelCase")]
    Join { user_id: String, community_id: String },
    #[serde(rename_all = "camelCase")]
    Award {
        user_id: String,
        community_id: String,
        source: SourceKind,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
    },
    #[serde(rename_all = "camelCase")]
    Claim { user_id: String, community_id: String },
    Flush,
    Background,
    #[serde(rename_all = "camelCase")]
    Show { user_id: String, community_id: String },
    #[serde(rename_all = "camelCase")]
    History {
        user_id: String,
        community_id: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    #[serde(rename_all = "camelCase")]
    Leaderboard {
        community_id: String,
        #[serde(default = "default_limit")]
        limit: usize,
    },
    Logout,
}

fn default_multiplier() -> f64 {
    1.0
}

fn default_limit() -> usize {
    10
}

type Session = FlushScheduler<InMemoryStore>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Logs go to stderr; stdout carries command results
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("progression={},info", args.log_level).into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }
    let config = args.progression_config();

    info!("======================================");
    info!("  Progression Engine");
    info!("======================================");
    info!("Flush interval: {}s", args.flush_interval_secs);
    info!("Flush threshold: {} awards", args.flush_threshold);
    info!("Store timeout: {}ms", args.store_timeout_ms);
    info!("Logout timeout: {}ms", args.logout_timeout_ms);
    info!("======================================");

    let store = match &args.seed_file {
        Some(path) => {
            let memberships = load_seed(path)?;
            info!(count = memberships.len(), path = %path.display(), "Seeded memberships");
            Arc::new(InMemoryStore::with_memberships(memberships))
        }
        None => Arc::new(InMemoryStore::new()),
    };

    let engine = Arc::new(ProgressionEngine::new(
        Arc::clone(&store),
        config.engine,
        config.cache,
    ));
    spawn_event_logger(&engine);

    let scheduler = FlushScheduler::new(Arc::clone(&engine), config.scheduler);
    scheduler.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Unrecognized command");
                emit(&json!({ "error": format!("invalid command: {}", e) }))?;
                continue;
            }
        };

        if matches!(command, Command::Logout) {
            break;
        }

        let output = match handle(&scheduler, &store, command).await {
            Ok(value) => value,
            Err(e) => json!({ "error": e.to_string() }),
        };
        emit(&output)?;
    }

    let report = scheduler.logout().await;
    emit(&json!({ "logout": report }))?;
    Ok(())
}

async fn handle(
    scheduler: &Session,
    store: &InMemoryStore,
    command: Command,
) -> anyhow::Result<Value> {
    let engine = scheduler.engine();

    let value = match command {
        Command::Join { user_id, community_id } => {
            let membership = Membership::new(user_id, community_id);
            let key = membership.key();
            store.insert_membership(membership).await;
            engine.invalidate_community(&key.community_id);
            json!({ "joined": key })
        }
        Command::Award {
            user_id,
            community_id,
            source,
            multiplier,
        } => {
            let key = MembershipKey::new(user_id, community_id);
            engine.award_xp_with_multiplier(&key, source, multiplier);
            json!({ "key": key, "pendingXp": engine.pending_xp(&key) })
        }
        Command::Claim { user_id, community_id } => {
            let key = MembershipKey::new(user_id, community_id);
            serde_json::to_value(engine.claim_daily_login(&key).await?)?
        }
        Command::Flush => serde_json::to_value(engine.flush_all().await)?,
        Command::Background => {
            scheduler.notify_background();
            json!({ "background": true })
        }
        Command::Show { user_id, community_id } => {
            let key = MembershipKey::new(user_id, community_id);
            let membership = engine.membership(&key).await?;
            let projected = engine.projected_progress(&key).await?;
            json!({ "membership": membership, "projected": projected })
        }
        Command::History {
            user_id,
            community_id,
            limit,
        } => {
            let key = MembershipKey::new(user_id, community_id);
            serde_json::to_value(engine.recent_transactions(&key, limit).await?)?
        }
        Command::Leaderboard { community_id, limit } => {
            serde_json::to_value(engine.leaderboard(&community_id, limit).await?)?
        }
        Command::Logout => json!({ "logout": "pending" }),
    };
    Ok(value)
}

fn emit(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

fn spawn_event_logger(engine: &Arc<ProgressionEngine<InMemoryStore>>) {
    let mut level_ups = engine.subscribe_level_ups();
    let mut badges = engine.subscribe_badge_unlocks();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = level_ups.recv() => match event {
                    Ok(e) => info!(
                        user = %e.user_id,
                        community = %e.community_id,
                        old_level = e.old_level,
                        new_level = e.new_level,
                        "Level up event"
                    ),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Level-up events lagged"),
                    Err(RecvError::Closed) => break,
                },
                event = badges.recv() => match event {
                    Ok(e) => info!(
                        user = %e.user_id,
                        community = %e.community_id,
                        badge = %e.badge.id,
                        "Badge unlock event"
                    ),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "Badge events lagged"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });
}
