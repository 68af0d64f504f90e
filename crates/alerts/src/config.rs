//! Engine configuration.

use sentinel_core::{SubscriptionTier, UserProfile};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Daily firing ceilings per subscription tier. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub free: Option<u32>,
    pub premium: Option<u32>,
    pub enterprise: Option<u32>,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: Some(20),
            premium: Some(200),
            enterprise: None,
        }
    }
}

impl TierLimits {
    pub fn for_tier(&self, tier: SubscriptionTier) -> Option<u32> {
        match tier {
            SubscriptionTier::Free => self.free,
            SubscriptionTier::Premium => self.premium,
            SubscriptionTier::Enterprise => self.enterprise,
        }
    }

    /// Effective ceiling: the tier limit, lowered by a personal cap if set.
    pub fn ceiling_for(&self, profile: &UserProfile) -> Option<u32> {
        let personal = profile.max_alerts_per_day.filter(|m| *m > 0);
        match (self.for_tier(profile.tier), personal) {
            (Some(tier), Some(personal)) => Some(tier.min(personal)),
            (Some(tier), None) => Some(tier),
            (None, personal) => personal,
        }
    }
}

/// Configuration for the cycle runner and dispatcher.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Distinct symbols fetched in parallel.
    pub max_concurrent_fetches: usize,
    /// Trigger events dispatched in parallel.
    pub max_concurrent_dispatches: usize,
    /// Overall budget for one cycle; rules not evaluated in time are deferred.
    pub max_cycle_duration: Duration,
    /// Timeout for a single channel send.
    pub delivery_timeout: Duration,
    /// Pause before the single retry of a transient delivery failure.
    pub retry_delay: Duration,
    pub tier_limits: TierLimits,
    /// Extra spacing between firings of `always` rules.
    pub always_min_interval: Option<Duration>,
    /// Days of trigger history kept by cleanup.
    pub history_retention_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            max_concurrent_dispatches: 16,
            max_cycle_duration: Duration::from_secs(45),
            delivery_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(250),
            tier_limits: TierLimits::default(),
            always_min_interval: None,
            history_retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_fetches, 8);
        assert_eq!(config.max_cycle_duration, Duration::from_secs(45));
        assert!(config.always_min_interval.is_none());
    }

    #[test]
    fn test_ceiling_for_tiers() {
        let limits = TierLimits::default();
        let mut profile = UserProfile::default_for("u");
        assert_eq!(limits.ceiling_for(&profile), Some(20));

        profile.tier = SubscriptionTier::Enterprise;
        assert_eq!(limits.ceiling_for(&profile), None);

        profile.max_alerts_per_day = Some(5);
        assert_eq!(limits.ceiling_for(&profile), Some(5));

        profile.tier = SubscriptionTier::Premium;
        profile.max_alerts_per_day = Some(500);
        assert_eq!(limits.ceiling_for(&profile), Some(200));
    }

    #[test]
    fn test_zero_personal_cap_ignored() {
        let limits = TierLimits::default();
        let mut profile = UserProfile::default_for("u");
        profile.max_alerts_per_day = Some(0);
        assert_eq!(limits.ceiling_for(&profile), Some(20));
    }
}
