//! Alert rule definitions.

use crate::market::{LookbackPeriod, Sentiment, VolumeBaseline};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default lookback window for news keyword rules.
pub const DEFAULT_NEWS_WINDOW_HOURS: u32 = 24;

/// How often a rule may re-fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    /// Fires once, then the rule is deactivated.
    Once,
    /// At most once per 24 hours.
    Daily,
    /// At most once per 7 days.
    Weekly,
    /// Every cycle the condition holds (rate limiter still applies).
    Always,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Once => "once",
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Always => "always",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "once" => Some(Frequency::Once),
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "always" => Some(Frequency::Always),
            _ => None,
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    InApp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::InApp => "in_app",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "email" => Some(Channel::Email),
            "in_app" => Some(Channel::InApp),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction filter for percentage moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Either,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Either => "either",
        }
    }
}

/// Kind-specific rule parameters.
///
/// Serialized as `{"kind": "...", "parameters": {...}}` so the stored JSON
/// stays keyed by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "snake_case")]
pub enum RuleCondition {
    PriceAbove {
        threshold: f64,
    },
    PriceBelow {
        threshold: f64,
    },
    PriceChangePct {
        percent: f64,
        period: LookbackPeriod,
        direction: Direction,
    },
    VolumeAbove {
        threshold: f64,
    },
    VolumeBelow {
        threshold: f64,
    },
    VolumeSpike {
        multiplier: f64,
        #[serde(default)]
        baseline: VolumeBaseline,
    },
    NewsKeyword {
        keywords: Vec<String>,
        /// `None` matches any sentiment.
        #[serde(default)]
        sentiment: Option<Sentiment>,
        #[serde(default = "default_news_window")]
        window_hours: u32,
    },
}

fn default_news_window() -> u32 {
    DEFAULT_NEWS_WINDOW_HOURS
}

/// Rejected rule parameters.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid {field}: {reason}")]
pub struct InvalidCondition {
    pub field: &'static str,
    pub reason: String,
}

impl InvalidCondition {
    fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

fn positive(field: &'static str, value: f64) -> Result<(), InvalidCondition> {
    if !value.is_finite() {
        return Err(InvalidCondition::new(field, "must be finite"));
    }
    if value <= 0.0 {
        return Err(InvalidCondition::new(field, format!("must be positive, got {}", value)));
    }
    Ok(())
}

impl RuleCondition {
    /// Stable identifier of the rule kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RuleCondition::PriceAbove { .. } => "price_above",
            RuleCondition::PriceBelow { .. } => "price_below",
            RuleCondition::PriceChangePct { .. } => "price_change_pct",
            RuleCondition::VolumeAbove { .. } => "volume_above",
            RuleCondition::VolumeBelow { .. } => "volume_below",
            RuleCondition::VolumeSpike { .. } => "volume_spike",
            RuleCondition::NewsKeyword { .. } => "news_keyword",
        }
    }

    /// Human-readable label used in notification titles.
    pub fn label(&self) -> &'static str {
        match self {
            RuleCondition::PriceAbove { .. } => "Price Above",
            RuleCondition::PriceBelow { .. } => "Price Below",
            RuleCondition::PriceChangePct { .. } => "Price Change %",
            RuleCondition::VolumeAbove { .. } => "Volume Above",
            RuleCondition::VolumeBelow { .. } => "Volume Below",
            RuleCondition::VolumeSpike { .. } => "Volume Spike",
            RuleCondition::NewsKeyword { .. } => "News Alert",
        }
    }

    pub fn validate(&self) -> Result<(), InvalidCondition> {
        match self {
            RuleCondition::PriceAbove { threshold }
            | RuleCondition::PriceBelow { threshold }
            | RuleCondition::VolumeAbove { threshold }
            | RuleCondition::VolumeBelow { threshold } => positive("threshold", *threshold),
            RuleCondition::PriceChangePct { percent, .. } => positive("percent", *percent),
            RuleCondition::VolumeSpike { multiplier, .. } => positive("multiplier", *multiplier),
            RuleCondition::NewsKeyword {
                keywords,
                window_hours,
                ..
            } => {
                if keywords.iter().all(|k| k.trim().is_empty()) {
                    return Err(InvalidCondition::new("keywords", "at least one keyword required"));
                }
                if *window_hours == 0 {
                    return Err(InvalidCondition::new("window_hours", "must be at least 1"));
                }
                Ok(())
            }
        }
    }

    /// Reference period this rule needs, if any.
    pub fn lookback(&self) -> Option<LookbackPeriod> {
        match self {
            RuleCondition::PriceChangePct { period, .. } => Some(*period),
            _ => None,
        }
    }

    /// Volume baseline this rule needs, if any.
    pub fn volume_baseline(&self) -> Option<VolumeBaseline> {
        match self {
            RuleCondition::VolumeSpike { baseline, .. } => Some(*baseline),
            _ => None,
        }
    }

    /// News window in hours, if this is a news rule.
    pub fn news_window_hours(&self) -> Option<u32> {
        match self {
            RuleCondition::NewsKeyword { window_hours, .. } => Some(*window_hours),
            _ => None,
        }
    }
}

/// A user-configured condition on one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Database ID (0 until stored).
    pub id: i64,
    pub user_id: String,
    pub symbol: CompactString,
    pub name: String,
    #[serde(flatten)]
    pub condition: RuleCondition,
    pub frequency: Frequency,
    pub channels: Vec<Channel>,
    pub is_active: bool,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub trigger_count: u32,
    pub created_at: DateTime<Utc>,
}

impl AlertRule {
    /// Create a new, active, never-triggered rule.
    pub fn new(
        user_id: impl Into<String>,
        symbol: &str,
        condition: RuleCondition,
        frequency: Frequency,
    ) -> Self {
        let symbol = CompactString::from(symbol.trim().to_uppercase());
        Self {
            id: 0,
            user_id: user_id.into(),
            name: format!("{} {}", symbol, condition.label()),
            symbol,
            condition,
            frequency,
            channels: vec![Channel::InApp],
            is_active: true,
            last_triggered_at: None,
            trigger_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Replace the channel set; duplicates are dropped.
    pub fn with_channels(mut self, channels: &[Channel]) -> Self {
        let mut channels = channels.to_vec();
        channels.sort();
        channels.dedup();
        self.channels = channels;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.condition.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_condition_json_is_keyed_by_kind() {
        let cond = RuleCondition::PriceAbove { threshold: 150.0 };
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "price_above", "parameters": {"threshold": 150.0}})
        );
    }

    #[test]
    fn test_news_condition_defaults() {
        let cond: RuleCondition = serde_json::from_str(
            r#"{"kind":"news_keyword","parameters":{"keywords":["merger"]}}"#,
        )
        .unwrap();
        assert_eq!(
            cond,
            RuleCondition::NewsKeyword {
                keywords: vec!["merger".to_string()],
                sentiment: None,
                window_hours: 24,
            }
        );
    }

    #[test]
    fn test_price_change_period_parsing() {
        let cond: RuleCondition = serde_json::from_str(
            r#"{"kind":"price_change_pct","parameters":{"percent":5,"period":"1w","direction":"either"}}"#,
        )
        .unwrap();
        assert_eq!(cond.lookback(), Some(LookbackPeriod::OneWeek));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let res: Result<RuleCondition, _> =
            serde_json::from_str(r#"{"kind":"earnings","parameters":{}}"#);
        assert!(res.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RuleCondition::PriceAbove { threshold: 1.0 }.validate().is_ok());
        assert!(RuleCondition::PriceBelow { threshold: 0.0 }.validate().is_err());
        assert!(RuleCondition::PriceAbove { threshold: f64::NAN }.validate().is_err());
        assert!(RuleCondition::VolumeSpike {
            multiplier: -2.0,
            baseline: VolumeBaseline::Avg30d
        }
        .validate()
        .is_err());

        let err = RuleCondition::NewsKeyword {
            keywords: vec!["  ".to_string()],
            sentiment: None,
            window_hours: 24,
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.field, "keywords");
    }

    #[test]
    fn test_rule_new_normalizes_symbol_and_channels() {
        let rule = AlertRule::new(
            "user-1",
            " aapl ",
            RuleCondition::PriceAbove { threshold: 150.0 },
            Frequency::Once,
        )
        .with_channels(&[Channel::InApp, Channel::Email, Channel::InApp]);

        assert_eq!(rule.symbol, "AAPL");
        assert_eq!(rule.name, "AAPL Price Above");
        assert_eq!(rule.channels, vec![Channel::Email, Channel::InApp]);
        assert!(rule.is_active);
        assert_eq!(rule.kind(), "price_above");
    }

    #[test]
    fn test_frequency_parse() {
        assert_eq!(Frequency::parse("DAILY"), Some(Frequency::Daily));
        assert_eq!(Frequency::parse("hourly"), None);
        assert_eq!(Frequency::Weekly.to_string(), "weekly");
    }
}
