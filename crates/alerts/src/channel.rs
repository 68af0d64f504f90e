//! Delivery channel contract and notification formatting.

use async_trait::async_trait;
use sentinel_core::{Channel, Comparison, ConditionMet, TriggerEvent, UserProfile};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Network trouble or server-side failure; worth one retry.
    #[error("Transient delivery failure: {0}")]
    Transient(String),
    /// Rejected request or bad recipient; never retried.
    #[error("Permanent delivery failure: {0}")]
    Permanent(String),
    #[error("Delivery timed out")]
    Timeout,
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_) | DeliveryError::Timeout)
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DeliveryError::Timeout
        } else if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                DeliveryError::Transient(err.to_string())
            } else {
                DeliveryError::Permanent(err.to_string())
            }
        } else if err.is_builder() {
            DeliveryError::Permanent(err.to_string())
        } else {
            DeliveryError::Transient(err.to_string())
        }
    }
}

/// Result of a successful `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Not sent by user preference (quiet hours, email disabled, no address).
    Skipped(String),
}

/// A rendered notification for one trigger event.
#[derive(Debug, Clone)]
pub struct Notification {
    pub event: TriggerEvent,
    pub profile: UserProfile,
    pub title: String,
    pub message: String,
}

impl Notification {
    pub fn new(event: TriggerEvent, profile: UserProfile) -> Self {
        let title = format!("{} {}", event.symbol, kind_label(&event.kind));
        let message = format_message(&event);
        Self {
            event,
            profile,
            title,
            message,
        }
    }

    /// Metadata stored with queued notifications.
    pub fn data(&self) -> serde_json::Value {
        let mut data = serde_json::json!({
            "rule_id": self.event.rule_id,
            "symbol": self.event.symbol.as_str(),
            "alert_type": self.event.kind,
        });
        for key in ["price", "volume", "change_pct"] {
            if let Some(v) = self.event.market_data.get(key) {
                data[key] = v.clone();
            }
        }
        data
    }
}

/// A delivery channel. `send` makes exactly one attempt; retries belong to the dispatcher.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn kind(&self) -> Channel;

    async fn send(&self, notification: &Notification) -> Result<SendOutcome, DeliveryError>;
}

/// Human-readable label for a rule kind.
pub fn kind_label(kind: &str) -> String {
    match kind {
        "price_above" => "Price Above".to_string(),
        "price_below" => "Price Below".to_string(),
        "price_change_pct" => "Price Change %".to_string(),
        "volume_above" => "Volume Above".to_string(),
        "volume_below" => "Volume Below".to_string(),
        "volume_spike" => "Volume Spike".to_string(),
        "news_keyword" => "News Alert".to_string(),
        other => other.replace('_', " "),
    }
}

/// Format price with two decimals.
pub fn format_price(price: f64) -> String {
    if price < 0.0 {
        format!("-${:.2}", price.abs())
    } else {
        format!("${:.2}", price)
    }
}

/// Format a volume with K/M/B suffixes.
pub fn format_volume(volume: f64) -> String {
    if volume >= 1_000_000_000.0 {
        format!("{:.1}B", volume / 1_000_000_000.0)
    } else if volume >= 1_000_000.0 {
        format!("{:.1}M", volume / 1_000_000.0)
    } else if volume >= 1_000.0 {
        format!("{:.1}K", volume / 1_000.0)
    } else {
        format!("{:.0}", volume)
    }
}

/// Notification body for a trigger event.
pub fn format_message(event: &TriggerEvent) -> String {
    let symbol = event.symbol.as_str();
    match &event.condition {
        ConditionMet::Price {
            price,
            threshold,
            comparison,
        } => match comparison {
            Comparison::Above => format!(
                "{} crossed above {} (current: {})",
                symbol,
                format_price(*threshold),
                format_price(*price)
            ),
            Comparison::Below => format!(
                "{} dropped below {} (current: {})",
                symbol,
                format_price(*threshold),
                format_price(*price)
            ),
        },
        ConditionMet::PriceChange {
            current,
            change_pct,
            period,
            ..
        } => format!(
            "{} moved {:+.2}% over {} (current: {})",
            symbol,
            change_pct,
            period,
            format_price(*current)
        ),
        ConditionMet::Volume {
            volume,
            threshold,
            comparison,
        } => match comparison {
            Comparison::Above => format!(
                "{} volume exceeded {} (current: {})",
                symbol,
                format_volume(*threshold),
                format_volume(*volume)
            ),
            Comparison::Below => format!(
                "{} volume dropped below {} (current: {})",
                symbol,
                format_volume(*threshold),
                format_volume(*volume)
            ),
        },
        ConditionMet::VolumeSpike {
            volume,
            baseline,
            ratio,
            ..
        } => format!(
            "{} volume spiked to {} ({:.1}x the {} average)",
            symbol,
            format_volume(*volume),
            ratio,
            format_volume(*baseline)
        ),
        ConditionMet::News {
            keyword, headline, ..
        } => match (keyword, headline) {
            (Some(k), Some(h)) => format!("{} news mentions \"{}\": {}", symbol, k, h),
            _ => format!("Alert triggered for {}", symbol),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use sentinel_core::{AlertRule, Frequency, RuleCondition};

    fn event(condition: ConditionMet) -> TriggerEvent {
        let rule = AlertRule::new(
            "u1",
            "AAPL",
            RuleCondition::PriceAbove { threshold: 150.0 },
            Frequency::Once,
        );
        TriggerEvent::new(
            &rule,
            condition,
            serde_json::json!({"price": 152.3, "volume": 1.0e6}),
            Utc::now(),
        )
    }

    #[test]
    fn test_format_volume() {
        assert_eq!(format_volume(0.0), "0");
        assert_eq!(format_volume(999.0), "999");
        assert_eq!(format_volume(1_500.0), "1.5K");
        assert_eq!(format_volume(45_000_000.0), "45.0M");
        assert_eq!(format_volume(2_500_000_000.0), "2.5B");
    }

    #[test]
    fn test_price_message_and_title() {
        let n = Notification::new(
            event(ConditionMet::Price {
                price: 152.3,
                threshold: 150.0,
                comparison: Comparison::Above,
            }),
            UserProfile::default_for("u1"),
        );
        assert_eq!(n.title, "AAPL Price Above");
        assert_eq!(n.message, "AAPL crossed above $150.00 (current: $152.30)");
        assert_eq!(n.data()["price"], 152.3);
    }

    #[test]
    fn test_volume_message() {
        let e = event(ConditionMet::Volume {
            volume: 800_000.0,
            threshold: 1_000_000.0,
            comparison: Comparison::Below,
        });
        assert_eq!(
            format_message(&e),
            "AAPL volume dropped below 1.0M (current: 800.0K)"
        );
    }

    #[test]
    fn test_kind_label_fallback() {
        assert_eq!(kind_label("volume_spike"), "Volume Spike");
        assert_eq!(kind_label("earnings_call"), "earnings call");
    }

    #[test]
    fn test_transient_classification() {
        assert!(DeliveryError::Timeout.is_transient());
        assert!(DeliveryError::Transient("502".into()).is_transient());
        assert!(!DeliveryError::Permanent("400".into()).is_transient());
    }
}
