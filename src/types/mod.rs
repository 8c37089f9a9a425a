//! Shared types: errors, durable records and events

pub mod error;
pub mod models;

pub use error::{ProgressionError, Result};
pub use models::{
    BadgeEligibility, BadgeUnlockEvent, DailyLoginFields, DailyLoginResult, LevelUpEvent,
    Membership, ProjectedProgress, SourceKind, XpTransaction,
};
