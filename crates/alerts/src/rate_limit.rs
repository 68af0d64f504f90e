//! Per-user daily firing limits.
//!
//! Counters are keyed by (user, local date), so a new day starts from zero
//! without any reset job.

use crate::config::TierLimits;
use crate::db::DbError;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use sentinel_core::UserProfile;
use std::sync::Arc;
use tracing::debug;

/// Counter store with an atomic check-and-increment.
#[async_trait]
pub trait RateCounter: Send + Sync {
    /// Increment the (user, day) counter if it is below `ceiling`.
    /// Returns whether the increment happened. Must be a single atomic step.
    async fn try_increment(&self, user_id: &str, day: NaiveDate, ceiling: u32)
        -> Result<bool, DbError>;

    /// Undo one increment for (user, day) whose firing was not committed.
    async fn release(&self, user_id: &str, day: NaiveDate) -> Result<(), DbError>;

    /// Current count for (user, day).
    async fn count(&self, user_id: &str, day: NaiveDate) -> Result<u32, DbError>;
}

/// In-process counter. The DashMap entry lock makes check-and-increment atomic.
#[derive(Debug, Default)]
pub struct InMemoryRateCounter {
    counts: DashMap<(String, NaiveDate), u32>,
}

impl InMemoryRateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop counters for days before `day`.
    pub fn prune_before(&self, day: NaiveDate) -> usize {
        let before = self.counts.len();
        self.counts.retain(|(_, d), _| *d >= day);
        before - self.counts.len()
    }
}

#[async_trait]
impl RateCounter for InMemoryRateCounter {
    async fn try_increment(
        &self,
        user_id: &str,
        day: NaiveDate,
        ceiling: u32,
    ) -> Result<bool, DbError> {
        let mut count = self
            .counts
            .entry((user_id.to_string(), day))
            .or_insert(0);
        if *count >= ceiling {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn release(&self, user_id: &str, day: NaiveDate) -> Result<(), DbError> {
        if let Some(mut count) = self.counts.get_mut(&(user_id.to_string(), day)) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn count(&self, user_id: &str, day: NaiveDate) -> Result<u32, DbError> {
        Ok(self
            .counts
            .get(&(user_id.to_string(), day))
            .map(|c| *c)
            .unwrap_or(0))
    }
}

/// Outcome of a consume attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { ceiling: Option<u32> },
    Limited { ceiling: u32 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

/// Tiered per-user daily rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    counter: Arc<dyn RateCounter>,
    limits: TierLimits,
}

impl RateLimiter {
    pub fn new(counter: Arc<dyn RateCounter>, limits: TierLimits) -> Self {
        Self { counter, limits }
    }

    pub fn in_memory(limits: TierLimits) -> Self {
        Self::new(Arc::new(InMemoryRateCounter::new()), limits)
    }

    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Consume one unit for `user_id` on `day` under `ceiling`.
    pub async fn try_consume(
        &self,
        user_id: &str,
        day: NaiveDate,
        ceiling: Option<u32>,
    ) -> Result<bool, DbError> {
        // Unlimited users are still counted.
        self.counter
            .try_increment(user_id, day, ceiling.unwrap_or(u32::MAX))
            .await
    }

    /// Consume one unit for the profile's user on their local calendar day.
    pub async fn consume_for(
        &self,
        profile: &UserProfile,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, DbError> {
        let day = profile.local_date(now);
        let ceiling = self.limits.ceiling_for(profile);
        if self.try_consume(&profile.user_id, day, ceiling).await? {
            Ok(RateDecision::Allowed { ceiling })
        } else {
            let ceiling = ceiling.unwrap_or(u32::MAX);
            debug!(
                user_id = %profile.user_id,
                day = %day,
                ceiling = ceiling,
                "Daily alert ceiling reached"
            );
            Ok(RateDecision::Limited { ceiling })
        }
    }

    /// Return the unit taken by `consume_for` when the trigger did not commit.
    pub async fn release_for(&self, profile: &UserProfile, at: DateTime<Utc>) -> Result<(), DbError> {
        self.counter
            .release(&profile.user_id, profile.local_date(at))
            .await
    }

    pub async fn used_today(&self, profile: &UserProfile, now: DateTime<Utc>) -> Result<u32, DbError> {
        self.counter
            .count(&profile.user_id, profile.local_date(now))
            .await
    }
}
