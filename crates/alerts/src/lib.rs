//! Alert processing engine.
//!
//! This crate provides:
//! - Condition evaluation against market snapshots
//! - Frequency cooldown and tiered daily rate limiting
//! - SQLite-based rule store and trigger history
//! - Email and in-app delivery with per-channel retry
//! - The cycle runner tying them together

pub mod channel;
pub mod config;
pub mod cooldown;
pub mod db;
pub mod dispatcher;
pub mod email;
pub mod evaluator;
pub mod in_app;
pub mod rate_limit;
pub mod report;
pub mod scheduler;

pub use channel::{DeliveryChannel, DeliveryError, Notification, SendOutcome};
pub use config::{EngineConfig, TierLimits};
pub use cooldown::{is_eligible, CooldownPolicy};
pub use db::{Database, DbError, InAppNotification, LoadedRules, MalformedRule, SuppressedTrigger};
pub use dispatcher::Dispatcher;
pub use email::{EmailChannel, EmailConfig};
pub use evaluator::{evaluate, Evaluation, EvaluationError};
pub use in_app::InAppChannel;
pub use rate_limit::{InMemoryRateCounter, RateCounter, RateDecision, RateLimiter};
pub use report::{CycleReport, RateLimitedTrigger, RuleSkip, SkipReason};
pub use scheduler::{CycleRunner, EngineError};
