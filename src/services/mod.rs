//! Services
//!
//! - [`progression`]: award intake, flushing, daily login and cached reads
//! - [`scheduler`]: background flush triggers and logout teardown

pub mod progression;
pub mod scheduler;

pub use progression::{EngineConfig, EngineStats, FlushOutcome, FlushReport, ProgressionEngine};
pub use scheduler::{FlushScheduler, FlushTrigger, LogoutReport, SchedulerConfig};
