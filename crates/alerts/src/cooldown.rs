//! Frequency / cooldown policy.

use chrono::{DateTime, Duration, Utc};
use sentinel_core::{AlertRule, Frequency};

/// Decides whether a rule may be evaluated this cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct CooldownPolicy {
    /// Extra spacing between firings of `always` rules.
    pub always_min_interval: Option<Duration>,
}

impl CooldownPolicy {
    pub fn new(always_min_interval: Option<std::time::Duration>) -> Self {
        Self {
            always_min_interval: always_min_interval.and_then(|d| Duration::from_std(d).ok()),
        }
    }

    /// Checked before any market data is fetched for the rule.
    pub fn is_eligible(&self, rule: &AlertRule, now: DateTime<Utc>) -> bool {
        if !rule.is_active {
            return false;
        }
        let last = match rule.last_triggered_at {
            None => return true,
            Some(last) => last,
        };
        let elapsed = now - last;
        match rule.frequency {
            Frequency::Once => false,
            Frequency::Daily => elapsed >= Duration::hours(24),
            Frequency::Weekly => elapsed >= Duration::days(7),
            Frequency::Always => match self.always_min_interval {
                Some(min) => elapsed >= min,
                None => true,
            },
        }
    }

    /// Earliest time the rule becomes eligible again, `None` if never.
    pub fn next_eligible_at(&self, rule: &AlertRule) -> Option<DateTime<Utc>> {
        if !rule.is_active {
            return None;
        }
        let last = match rule.last_triggered_at {
            None => return Some(rule.created_at),
            Some(last) => last,
        };
        match rule.frequency {
            Frequency::Once => None,
            Frequency::Daily => Some(last + Duration::hours(24)),
            Frequency::Weekly => Some(last + Duration::days(7)),
            Frequency::Always => Some(last + self.always_min_interval.unwrap_or_else(Duration::zero)),
        }
    }
}

/// `CooldownPolicy::default().is_eligible(rule, now)`.
pub fn is_eligible(rule: &AlertRule, now: DateTime<Utc>) -> bool {
    CooldownPolicy::default().is_eligible(rule, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_core::RuleCondition;

    fn rule(frequency: Frequency, last: Option<DateTime<Utc>>) -> AlertRule {
        let mut rule = AlertRule::new(
            "user-1",
            "AAPL",
            RuleCondition::PriceAbove { threshold: 1.0 },
            frequency,
        );
        rule.last_triggered_at = last;
        rule
    }

    #[test]
    fn test_once() {
        let now = Utc::now();
        assert!(is_eligible(&rule(Frequency::Once, None), now));
        assert!(!is_eligible(&rule(Frequency::Once, Some(now - Duration::days(365))), now));
    }

    #[test]
    fn test_daily_window() {
        let now = Utc::now();
        assert!(is_eligible(&rule(Frequency::Daily, None), now));
        assert!(!is_eligible(
            &rule(Frequency::Daily, Some(now - Duration::hours(23) - Duration::minutes(59))),
            now
        ));
        assert!(is_eligible(&rule(Frequency::Daily, Some(now - Duration::hours(24))), now));
    }

    #[test]
    fn test_weekly_window() {
        let now = Utc::now();
        assert!(!is_eligible(&rule(Frequency::Weekly, Some(now - Duration::days(6))), now));
        assert!(is_eligible(&rule(Frequency::Weekly, Some(now - Duration::days(7))), now));
    }

    #[test]
    fn test_always() {
        let now = Utc::now();
        assert!(is_eligible(&rule(Frequency::Always, Some(now)), now));

        let policy = CooldownPolicy::new(Some(std::time::Duration::from_secs(300)));
        assert!(!policy.is_eligible(&rule(Frequency::Always, Some(now - Duration::minutes(4))), now));
        assert!(policy.is_eligible(&rule(Frequency::Always, Some(now - Duration::minutes(5))), now));
    }

    #[test]
    fn test_inactive_never_eligible() {
        let mut r = rule(Frequency::Always, None);
        r.is_active = false;
        assert!(!is_eligible(&r, Utc::now()));
        assert_eq!(CooldownPolicy::default().next_eligible_at(&r), None);
    }

    #[test]
    fn test_next_eligible_at() {
        let now = Utc::now();
        let policy = CooldownPolicy::default();
        assert_eq!(
            policy.next_eligible_at(&rule(Frequency::Daily, Some(now))),
            Some(now + Duration::hours(24))
        );
        assert_eq!(policy.next_eligible_at(&rule(Frequency::Once, Some(now))), None);
    }
}
