//! Flush scheduler - decides when the engine's buffers are written
//!
//! A single background task runs `flush_all` whenever one of these fires:
//! - the fixed flush interval
//! - the engine's size trigger (buffered awards reached the threshold)
//! - `notify_background` (app moved to background)
//!
//! `logout` stops the task and performs one last flush bounded by the logout
//! timeout. Whatever could not be written by then is discarded and the
//! caches are cleared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::progression::{FlushReport, ProgressionEngine};
use crate::store::ProgressionStore;

/// Scheduler timing
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between periodic flushes
    pub flush_interval: Duration,
    /// Bound on the final flush performed at logout
    pub logout_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(30),
            logout_timeout: Duration::from_secs(3),
        }
    }
}

/// What woke the flush task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Interval,
    SizeThreshold,
    Background,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::SizeThreshold => "size_threshold",
            Self::Background => "background",
        }
    }
}

/// Result of a logout
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutReport {
    /// Final flush result; `None` if it timed out
    pub flushed: Option<FlushReport>,
    pub timed_out: bool,
    /// Pending XP abandoned after the final flush
    pub discarded_xp: i64,
}

pub struct FlushScheduler<S: ProgressionStore + 'static> {
    engine: Arc<ProgressionEngine<S>>,
    config: SchedulerConfig,
    running: AtomicBool,
    background: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    sweep_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: ProgressionStore + 'static> FlushScheduler<S> {
    pub fn new(engine: Arc<ProgressionEngine<S>>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            engine,
            config,
            running: AtomicBool::new(false),
            background: Arc::new(Notify::new()),
            shutdown_tx,
            flush_task: Mutex::new(None),
            sweep_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn engine(&self) -> &Arc<ProgressionEngine<S>> {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the flush task and the cache sweep tasks.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Flush scheduler already running");
            return;
        }

        let engine = Arc::clone(&self.engine);
        let background = Arc::clone(&self.background);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.config.flush_interval;

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs_f64(), "Flush task started");

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                let trigger = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => FlushTrigger::Interval,
                    _ = engine.flush_requested() => FlushTrigger::SizeThreshold,
                    _ = background.notified() => FlushTrigger::Background,
                };

                let report = engine.flush_all().await;
                debug!(
                    trigger = trigger.as_str(),
                    committed = report.committed,
                    requeued = report.requeued,
                    "Scheduled flush completed"
                );
            }

            info!("Flush task stopping");
        });

        *self.flush_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *self.sweep_tasks.lock().unwrap_or_else(PoisonError::into_inner) =
            self.engine.spawn_sweep_tasks();
    }

    /// Request an immediate flush (app moved to background).
    pub fn notify_background(&self) {
        self.background.notify_one();
    }

    /// Stop the scheduler, flush once more, then tear the session down.
    pub async fn logout(&self) -> LogoutReport {
        self.running.store(false, Ordering::SeqCst);
        // No receiver means the task never started
        let _ = self.shutdown_tx.send(true);

        for sweep in self
            .sweep_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            sweep.abort();
        }

        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = flush_task {
            if tokio::time::timeout(self.config.logout_timeout, &mut handle)
                .await
                .is_err()
            {
                warn!("Flush task did not stop in time, aborting");
                handle.abort();
            }
        }

        let report = match tokio::time::timeout(self.config.logout_timeout, self.engine.flush_all()).await {
            Ok(flushed) => LogoutReport {
                flushed: Some(flushed),
                timed_out: false,
                discarded_xp: self.engine.discard_pending(),
            },
            Err(_) => {
                warn!(
                    timeout_ms = self.config.logout_timeout.as_millis() as u64,
                    "Logout flush timed out, abandoning pending XP"
                );
                LogoutReport {
                    flushed: None,
                    timed_out: true,
                    discarded_xp: self.engine.discard_pending(),
                }
            }
        };

        self.engine.shutdown();
        info!(
            timed_out = report.timed_out,
            discarded_xp = report.discarded_xp,
            "Logout complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, MembershipKey};
    use crate::services::EngineConfig;
    use crate::store::InMemoryStore;
    use crate::types::{Membership, SourceKind};

    fn setup(
        engine_config: EngineConfig,
        config: SchedulerConfig,
    ) -> (Arc<InMemoryStore>, FlushScheduler<InMemoryStore>, MembershipKey) {
        let store = Arc::new(InMemoryStore::with_memberships([Membership::new("alice", "rust")]));
        let engine = Arc::new(ProgressionEngine::new(
            Arc::clone(&store),
            engine_config,
            CacheConfig::default(),
        ));
        (store, FlushScheduler::new(engine, config), MembershipKey::new("alice", "rust"))
    }

    fn idle_interval() -> SchedulerConfig {
        SchedulerConfig {
            flush_interval: Duration::from_secs(3600),
            logout_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_interval_flush() {
        let (store, scheduler, key) = setup(
            EngineConfig::default(),
            SchedulerConfig {
                flush_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );
        scheduler.start();
        scheduler.engine().award_xp(&key, SourceKind::TextPost);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.snapshot(&key).await.unwrap().xp, 10);

        scheduler.logout().await;
    }

    #[tokio::test]
    async fn test_size_trigger_flush() {
        let (store, scheduler, key) = setup(
            EngineConfig {
                flush_threshold: 3,
                ..Default::default()
            },
            idle_interval(),
        );
        scheduler.start();

        for _ in 0..3 {
            scheduler.engine().award_xp(&key, SourceKind::Reply);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.snapshot(&key).await.unwrap().xp, 15);

        scheduler.logout().await;
    }

    #[tokio::test]
    async fn test_background_flush() {
        let (store, scheduler, key) = setup(EngineConfig::default(), idle_interval());
        scheduler.start();

        scheduler.engine().award_xp(&key, SourceKind::VideoPost);
        scheduler.notify_background();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.snapshot(&key).await.unwrap().xp, 25);

        scheduler.logout().await;
    }

    #[tokio::test]
    async fn test_logout_flushes_and_stops() {
        let (store, scheduler, key) = setup(EngineConfig::default(), idle_interval());
        scheduler.start();
        assert!(scheduler.is_running());

        scheduler.engine().award_xp(&key, SourceKind::TextPost);
        scheduler.engine().membership(&key).await.unwrap();

        let report = scheduler.logout().await;
        assert!(!report.timed_out);
        assert_eq!(report.flushed.unwrap().committed, 1);
        assert_eq!(report.discarded_xp, 0);

        assert!(!scheduler.is_running());
        assert_eq!(store.snapshot(&key).await.unwrap().xp, 10);
        assert_eq!(scheduler.engine().stats().memberships.entries, 0);
    }

    #[tokio::test]
    async fn test_logout_abandons_unwritable_xp() {
        let (store, scheduler, key) = setup(EngineConfig::default(), idle_interval());
        scheduler.start();

        scheduler.engine().award_xp(&key, SourceKind::TextPost);
        store.set_unavailable(true);

        let report = scheduler.logout().await;
        assert_eq!(report.flushed.unwrap().requeued, 1);
        assert_eq!(report.discarded_xp, 10);
        assert_eq!(scheduler.engine().pending_xp(&key), 0);
    }

    #[tokio::test]
    async fn test_logout_flush_timeout() {
        let (store, scheduler, key) = setup(
            EngineConfig::default(),
            SchedulerConfig {
                flush_interval: Duration::from_secs(3600),
                logout_timeout: Duration::from_millis(50),
            },
        );

        scheduler.engine().award_xp(&key, SourceKind::TextPost);
        store.set_latency(Duration::from_millis(500));

        let report = scheduler.logout().await;
        assert!(report.timed_out);
        assert!(report.flushed.is_none());
        // The cancelled flush put its XP back, so it is reported as discarded
        assert_eq!(report.discarded_xp, 10);
        assert_eq!(scheduler.engine().pending_xp(&key), 0);
        assert_eq!(store.snapshot(&key).await.unwrap().xp, 0);
    }

    #[tokio::test]
    async fn test_start_twice_is_noop() {
        let (_, scheduler, _) = setup(EngineConfig::default(), idle_interval());
        scheduler.start();
        scheduler.start();
        assert!(scheduler.is_running());
        scheduler.logout().await;
    }
}
