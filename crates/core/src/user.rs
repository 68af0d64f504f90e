//! Per-user settings the engine reads.

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Subscription tier, which sets the daily firing ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Enterprise,
}

impl SubscriptionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Premium => "premium",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "free" => Some(SubscriptionTier::Free),
            "premium" => Some(SubscriptionTier::Premium),
            "enterprise" => Some(SubscriptionTier::Enterprise),
            _ => None,
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local time window during which email is held back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuietHours {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Inclusive on both ends; `start > end` wraps past midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        if self.start <= self.end {
            t >= self.start && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }
}

/// Notification and limit settings for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub email: Option<String>,
    pub full_name: String,
    pub email_enabled: bool,
    pub tier: SubscriptionTier,
    /// IANA zone name (e.g. `America/New_York`) for the rate-limit day and quiet hours.
    pub timezone: String,
    pub quiet_hours: Option<QuietHours>,
    /// Personal cap, applied on top of the tier ceiling.
    pub max_alerts_per_day: Option<u32>,
}

impl UserProfile {
    /// Defaults for a user with no stored profile.
    pub fn default_for(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            full_name: String::new(),
            email_enabled: false,
            tier: SubscriptionTier::Free,
            timezone: "UTC".to_string(),
            quiet_hours: None,
            max_alerts_per_day: None,
        }
    }

    /// Resolved zone; unknown names fall back to UTC.
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Calendar date in the user's timezone.
    pub fn local_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.tz()).date_naive()
    }

    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        match self.quiet_hours {
            Some(q) => q.contains(now.with_timezone(&self.tz()).time()),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let q = QuietHours::new(t(8, 0), t(22, 0));
        assert!(q.contains(t(8, 0)));
        assert!(q.contains(t(12, 30)));
        assert!(!q.contains(t(23, 0)));
    }

    #[test]
    fn test_quiet_hours_overnight() {
        let q = QuietHours::new(t(22, 0), t(7, 0));
        assert!(q.contains(t(23, 15)));
        assert!(q.contains(t(3, 0)));
        assert!(!q.contains(t(12, 0)));
    }

    #[test]
    fn test_local_date_uses_timezone() {
        let mut profile = UserProfile::default_for("u");
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 2, 0, 0).unwrap();
        assert_eq!(profile.local_date(now), NaiveDate::from_ymd_opt(2024, 3, 9).unwrap());

        // 21:00 EST on the 8th.
        profile.timezone = "America/New_York".to_string();
        assert_eq!(profile.local_date(now), NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
    }

    #[test]
    fn test_local_date_follows_daylight_saving() {
        let mut profile = UserProfile::default_for("u");
        profile.timezone = "America/New_York".to_string();

        // 00:30 EDT on Jul 2 (UTC-4), which a fixed winter offset would put on Jul 1.
        let summer = Utc.with_ymd_and_hms(2024, 7, 2, 4, 30, 0).unwrap();
        assert_eq!(profile.local_date(summer), NaiveDate::from_ymd_opt(2024, 7, 2).unwrap());

        // Same UTC clock time in January is 23:30 EST on Jan 1.
        let winter = Utc.with_ymd_and_hms(2024, 1, 2, 4, 30, 0).unwrap();
        assert_eq!(profile.local_date(winter), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }

    #[test]
    fn test_quiet_hours_in_user_timezone() {
        let mut profile = UserProfile::default_for("u");
        profile.quiet_hours = Some(QuietHours::new(t(22, 0), t(7, 0)));
        profile.timezone = "Europe/Berlin".to_string();
        // 21:30 UTC is 23:30 CEST.
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 21, 30, 0).unwrap();
        assert!(profile.in_quiet_hours(now));
        profile.timezone = "UTC".to_string();
        assert!(!profile.in_quiet_hours(now));
    }

    #[test]
    fn test_quiet_hours_shift_with_daylight_saving() {
        let mut profile = UserProfile::default_for("u");
        profile.timezone = "America/New_York".to_string();
        profile.quiet_hours = Some(QuietHours::new(t(22, 0), t(7, 0)));
        // 11:30 UTC: 07:30 EDT in summer, 06:30 EST in winter.
        let summer = Utc.with_ymd_and_hms(2024, 7, 15, 11, 30, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2024, 1, 15, 11, 30, 0).unwrap();
        assert!(!profile.in_quiet_hours(summer));
        assert!(profile.in_quiet_hours(winter));
    }

    #[test]
    fn test_unknown_timezone_falls_back_to_utc() {
        let mut profile = UserProfile::default_for("u");
        profile.timezone = "Mars/Olympus_Mons".to_string();
        assert_eq!(profile.tz(), Tz::UTC);
        let now = Utc.with_ymd_and_hms(2024, 7, 2, 0, 30, 0).unwrap();
        assert_eq!(profile.local_date(now), NaiveDate::from_ymd_opt(2024, 7, 2).unwrap());
    }
}
