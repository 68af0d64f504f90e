//! Trigger events and the condition values that caused them.

use crate::market::Sentiment;
use crate::rule::{AlertRule, Channel};
use chrono::{DateTime, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};

/// Comparison used by threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Above,
    Below,
}

impl Comparison {
    pub fn as_str(&self) -> &'static str {
        match self {
            Comparison::Above => "above",
            Comparison::Below => "below",
        }
    }
}

/// The exact observed values an evaluation compared.
///
/// Produced for every evaluation, triggered or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionMet {
    Price {
        price: f64,
        threshold: f64,
        comparison: Comparison,
    },
    PriceChange {
        current: f64,
        reference: f64,
        change_pct: f64,
        percent: f64,
        period: String,
        direction: String,
    },
    Volume {
        volume: f64,
        threshold: f64,
        comparison: Comparison,
    },
    VolumeSpike {
        volume: f64,
        baseline: f64,
        ratio: f64,
        multiplier: f64,
    },
    News {
        /// Keyword that matched, if any.
        keyword: Option<String>,
        headline: Option<String>,
        sentiment: Option<Sentiment>,
        published_at: Option<DateTime<Utc>>,
        articles_scanned: usize,
    },
}

/// A fired rule, persisted as an audit record independent of delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Database ID (0 until recorded).
    pub id: i64,
    pub rule_id: i64,
    pub user_id: String,
    pub symbol: CompactString,
    pub rule_name: String,
    pub kind: String,
    pub condition: ConditionMet,
    /// Market data at evaluation time.
    pub market_data: serde_json::Value,
    pub channels: Vec<Channel>,
    pub triggered_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(
        rule: &AlertRule,
        condition: ConditionMet,
        market_data: serde_json::Value,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            rule_id: rule.id,
            user_id: rule.user_id.clone(),
            symbol: rule.symbol.clone(),
            rule_name: rule.name.clone(),
            kind: rule.kind().to_string(),
            condition,
            market_data,
            channels: rule.channels.clone(),
            triggered_at,
        }
    }
}
