//! Per-cycle summary.

use chrono::{DateTime, Utc};
use sentinel_core::{DeliveryAttempt, TriggerEvent};
use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Why a rule produced no trigger this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    /// Market data missing; the rule is retried next cycle.
    DataUnavailable(String),
    /// Bad parameters or an unreadable stored rule.
    EvaluationError(String),
    /// Profile lookup, counter or trigger commit failed.
    Store(String),
    /// The rule's state changed between load and commit.
    AlreadyFired,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSkip {
    pub rule_id: i64,
    pub symbol: String,
    pub reason: SkipReason,
}

/// A trigger held back by the user's daily ceiling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitedTrigger {
    pub rule_id: i64,
    pub user_id: String,
    pub ceiling: u32,
}

/// Outcome of one `run_cycle` call.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Active rules loaded, including malformed rows.
    pub rules_considered: usize,
    /// Rules filtered out by the frequency policy before fetching.
    pub ineligible: usize,
    /// Distinct symbols successfully fetched.
    pub symbols_fetched: usize,
    pub not_triggered: usize,
    pub triggered: Vec<TriggerEvent>,
    pub skipped: Vec<RuleSkip>,
    pub rate_limited: Vec<RateLimitedTrigger>,
    /// Rules not evaluated before the cycle deadline.
    pub deferred: Vec<i64>,
    pub deliveries: Vec<DeliveryAttempt>,
}

impl CycleReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            duration: Duration::ZERO,
            rules_considered: 0,
            ineligible: 0,
            symbols_fetched: 0,
            not_triggered: 0,
            triggered: Vec::new(),
            skipped: Vec::new(),
            rate_limited: Vec::new(),
            deferred: Vec::new(),
            deliveries: Vec::new(),
        }
    }

    pub fn skip(&mut self, rule_id: i64, symbol: &str, reason: SkipReason) {
        self.skipped.push(RuleSkip {
            rule_id,
            symbol: symbol.to_string(),
            reason,
        });
    }

    pub fn deliveries_sent(&self) -> usize {
        self.deliveries.iter().filter(|a| a.is_sent()).count()
    }

    pub fn deliveries_failed(&self) -> usize {
        self.deliveries.iter().filter(|a| a.is_failed()).count()
    }

    /// Skips for a given rule.
    pub fn skips_for(&self, rule_id: i64) -> impl Iterator<Item = &RuleSkip> {
        self.skipped.iter().filter(move |s| s.rule_id == rule_id)
    }

    pub fn log_summary(&self) {
        info!(
            considered = self.rules_considered,
            ineligible = self.ineligible,
            symbols = self.symbols_fetched,
            triggered = self.triggered.len(),
            not_triggered = self.not_triggered,
            skipped = self.skipped.len(),
            rate_limited = self.rate_limited.len(),
            deferred = self.deferred.len(),
            sent = self.deliveries_sent(),
            failed = self.deliveries_failed(),
            duration_ms = self.duration.as_millis() as u64,
            "Cycle complete"
        );
    }
}
