//! Market data types consumed by the evaluator.

use chrono::{DateTime, Duration, Utc};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Current quote for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub price: f64,
    /// Change versus previous close, in percent.
    pub change_pct: f64,
    pub volume: f64,
    /// 30-day average volume, when the provider knows it.
    pub avg_volume: Option<f64>,
}

/// Lookback period for percentage moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookbackPeriod {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
}

impl LookbackPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookbackPeriod::OneDay => "1d",
            LookbackPeriod::OneWeek => "1w",
            LookbackPeriod::OneMonth => "1m",
        }
    }

    /// Number of calendar days covered.
    pub fn days(&self) -> u32 {
        match self {
            LookbackPeriod::OneDay => 1,
            LookbackPeriod::OneWeek => 7,
            LookbackPeriod::OneMonth => 30,
        }
    }
}

/// Baseline for volume spike detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VolumeBaseline {
    #[default]
    #[serde(rename = "avg_30d")]
    Avg30d,
    #[serde(rename = "avg_90d")]
    Avg90d,
}

impl VolumeBaseline {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeBaseline::Avg30d => "avg_30d",
            VolumeBaseline::Avg90d => "avg_90d",
        }
    }

    pub fn days(&self) -> u32 {
        match self {
            VolumeBaseline::Avg30d => 30,
            VolumeBaseline::Avg90d => 90,
        }
    }
}

/// Article sentiment as tagged by the news provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

/// A recent news article for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub headline: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub sentiment: Option<Sentiment>,
    pub published_at: DateTime<Utc>,
}

/// Outcome of a single lookup that may be unavailable this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Lookup<T> {
    Available(T),
    Unavailable(String),
}

impl<T> Lookup<T> {
    pub fn available(&self) -> Option<&T> {
        match self {
            Lookup::Available(v) => Some(v),
            Lookup::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Lookup::Available(_))
    }
}

/// Everything known about one symbol at one evaluation instant.
///
/// Only the lookups some rule on the symbol needs are populated; a missing
/// entry means nobody asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSnapshot {
    pub symbol: CompactString,
    pub fetched_at: DateTime<Utc>,
    pub quote: Lookup<Quote>,
    pub reference_prices: HashMap<LookbackPeriod, Lookup<f64>>,
    pub volume_baselines: HashMap<VolumeBaseline, Lookup<f64>>,
    pub news: Option<Lookup<Vec<NewsArticle>>>,
}

impl MarketSnapshot {
    /// Snapshot with only a quote.
    pub fn new(symbol: &str, fetched_at: DateTime<Utc>, quote: Lookup<Quote>) -> Self {
        Self {
            symbol: CompactString::from(symbol),
            fetched_at,
            quote,
            reference_prices: HashMap::new(),
            volume_baselines: HashMap::new(),
            news: None,
        }
    }

    pub fn with_reference_price(mut self, period: LookbackPeriod, price: Lookup<f64>) -> Self {
        self.reference_prices.insert(period, price);
        self
    }

    pub fn with_volume_baseline(mut self, baseline: VolumeBaseline, volume: Lookup<f64>) -> Self {
        self.volume_baselines.insert(baseline, volume);
        self
    }

    pub fn with_news(mut self, news: Lookup<Vec<NewsArticle>>) -> Self {
        self.news = Some(news);
        self
    }

    /// Articles published within `window_hours` before `fetched_at`.
    pub fn recent_news(&self, window_hours: u32) -> Option<Result<Vec<&NewsArticle>, &str>> {
        let cutoff = self.fetched_at - Duration::hours(i64::from(window_hours));
        self.news.as_ref().map(|lookup| match lookup {
            Lookup::Available(articles) => Ok(articles
                .iter()
                .filter(|a| a.published_at >= cutoff && a.published_at <= self.fetched_at)
                .collect()),
            Lookup::Unavailable(reason) => Err(reason.as_str()),
        })
    }

    /// Compact JSON summary stored alongside trigger records.
    pub fn summary(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "symbol": self.symbol.as_str(),
            "fetched_at": self.fetched_at.to_rfc3339(),
        });
        if let Some(q) = self.quote.available() {
            value["price"] = serde_json::json!(q.price);
            value["change_pct"] = serde_json::json!(q.change_pct);
            value["volume"] = serde_json::json!(q.volume);
            if let Some(avg) = q.avg_volume {
                value["avg_volume"] = serde_json::json!(avg);
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(headline: &str, hours_ago: i64, now: DateTime<Utc>) -> NewsArticle {
        NewsArticle {
            headline: headline.to_string(),
            summary: String::new(),
            sentiment: None,
            published_at: now - Duration::hours(hours_ago),
        }
    }

    #[test]
    fn test_recent_news_window() {
        let now = Utc::now();
        let snapshot = MarketSnapshot::new(
            "AAPL",
            now,
            Lookup::Unavailable("closed".to_string()),
        )
        .with_news(Lookup::Available(vec![
            article("fresh", 1, now),
            article("stale", 30, now),
        ]));

        let recent = snapshot.recent_news(24).unwrap().unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].headline, "fresh");
    }

    #[test]
    fn test_recent_news_not_requested() {
        let snapshot = MarketSnapshot::new("AAPL", Utc::now(), Lookup::Unavailable(String::new()));
        assert!(snapshot.recent_news(24).is_none());
    }

    #[test]
    fn test_summary_includes_quote() {
        let quote = Quote {
            price: 152.34,
            change_pct: 1.2,
            volume: 1000.0,
            avg_volume: None,
        };
        let snapshot = MarketSnapshot::new("AAPL", Utc::now(), Lookup::Available(quote));
        let summary = snapshot.summary();
        assert_eq!(summary["price"], 152.34);
        assert_eq!(summary["symbol"], "AAPL");
        assert!(summary.get("avg_volume").is_none());
    }

    #[test]
    fn test_period_serde() {
        assert_eq!(serde_json::to_string(&LookbackPeriod::OneMonth).unwrap(), "\"1m\"");
        assert_eq!(
            serde_json::from_str::<VolumeBaseline>("\"avg_90d\"").unwrap(),
            VolumeBaseline::Avg90d
        );
    }
}
