//! REST market data adapter.
//!
//! Talks to a Polygon-compatible HTTP API. Missing tickers, empty result sets
//! and non-positive prices map to [`FeedError::Unavailable`].

use crate::error::{FeedError, FeedResult};
use crate::provider::MarketDataProvider;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sentinel_core::{LookbackPeriod, NewsArticle, Quote, Sentiment};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

/// Configuration for [`RestMarketData`].
#[derive(Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl std::fmt::Debug for RestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestConfig")
            .field("base_url", &self.base_url)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.polygon.io".to_string(),
            api_key: String::new(),
            timeout_ms: 5000,
        }
    }
}

/// HTTP market data adapter.
#[derive(Clone)]
pub struct RestMarketData {
    http: reqwest::Client,
    config: RestConfig,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    ticker: Option<TickerSnapshot>,
}

#[derive(Debug, Deserialize)]
struct TickerSnapshot {
    #[serde(rename = "todaysChangePerc", default)]
    todays_change_perc: f64,
    #[serde(default)]
    day: Option<Bar>,
    #[serde(rename = "lastTrade", default)]
    last_trade: Option<LastTrade>,
    #[serde(rename = "prevDay", default)]
    prev_day: Option<Bar>,
}

#[derive(Debug, Deserialize)]
struct Bar {
    #[serde(default)]
    c: f64,
    #[serde(default)]
    v: f64,
}

#[derive(Debug, Deserialize)]
struct LastTrade {
    p: f64,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<Bar>,
}

#[derive(Debug, Deserialize)]
struct NewsResponse {
    #[serde(default)]
    results: Vec<NewsItem>,
}

#[derive(Debug, Deserialize)]
struct NewsItem {
    title: String,
    #[serde(default)]
    description: Option<String>,
    published_utc: DateTime<Utc>,
    #[serde(default)]
    insights: Vec<Insight>,
}

#[derive(Debug, Deserialize)]
struct Insight {
    ticker: String,
    sentiment: String,
}

fn parse_sentiment(s: &str) -> Option<Sentiment> {
    match s {
        "positive" => Some(Sentiment::Positive),
        "negative" => Some(Sentiment::Negative),
        "neutral" => Some(Sentiment::Neutral),
        _ => None,
    }
}

impl RestMarketData {
    pub fn new(config: RestConfig) -> FeedResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self { http, config })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> FeedResult<T> {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .query(&[("apiKey", self.config.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FeedError::Unavailable(format!("{} not found", path)));
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FeedError::RateLimitExceeded);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::Http {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<T>().await?)
    }

    async fn daily_bars(&self, symbol: &str, days: u32) -> FeedResult<Vec<Bar>> {
        let to = Utc::now().date_naive();
        let from = to - Duration::days(i64::from(days));
        let path = format!("/v2/aggs/ticker/{}/range/1/day/{}/{}", symbol, from, to);
        let resp: AggsResponse = self
            .get_json(&path, &[("adjusted", "true".to_string()), ("sort", "asc".to_string())])
            .await?;
        Ok(resp.results)
    }
}

#[async_trait]
impl MarketDataProvider for RestMarketData {
    async fn get_quote(&self, symbol: &str) -> FeedResult<Quote> {
        let path = format!("/v2/snapshot/locale/us/markets/stocks/tickers/{}", symbol);
        let resp: SnapshotResponse = self.get_json(&path, &[]).await?;
        let ticker = resp
            .ticker
            .ok_or_else(|| FeedError::Unavailable(format!("no snapshot for {}", symbol)))?;

        let price = ticker
            .last_trade
            .as_ref()
            .map(|t| t.p)
            .or_else(|| ticker.day.as_ref().map(|d| d.c))
            .unwrap_or(0.0);
        if !price.is_finite() || price <= 0.0 {
            return Err(FeedError::Unavailable(format!("no price for {}", symbol)));
        }

        let volume = ticker
            .day
            .as_ref()
            .map(|d| d.v)
            .filter(|v| *v > 0.0)
            .or_else(|| ticker.prev_day.as_ref().map(|d| d.v))
            .unwrap_or(0.0);

        // Snapshot has no average; a failed lookup leaves it unknown.
        let avg_volume = match self.get_average_volume(symbol, 30).await {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(symbol = symbol, error = %e, "Average volume unavailable");
                None
            }
        };

        Ok(Quote {
            price,
            change_pct: ticker.todays_change_perc,
            volume,
            avg_volume,
        })
    }

    async fn get_historical_price(&self, symbol: &str, period: LookbackPeriod) -> FeedResult<f64> {
        let close = match period {
            LookbackPeriod::OneDay => {
                let path = format!("/v2/aggs/ticker/{}/prev", symbol);
                let resp: AggsResponse = self.get_json(&path, &[]).await?;
                resp.results.first().map(|b| b.c)
            }
            _ => self
                .daily_bars(symbol, period.days())
                .await?
                .first()
                .map(|b| b.c),
        };

        match close {
            Some(c) if c.is_finite() && c > 0.0 => Ok(c),
            _ => Err(FeedError::Unavailable(format!(
                "no {} reference price for {}",
                period.as_str(),
                symbol
            ))),
        }
    }

    async fn get_average_volume(&self, symbol: &str, days: u32) -> FeedResult<f64> {
        let bars = self.daily_bars(symbol, days).await?;
        if bars.is_empty() {
            return Err(FeedError::Unavailable(format!("no volume history for {}", symbol)));
        }
        let avg = bars.iter().map(|b| b.v).sum::<f64>() / bars.len() as f64;
        if avg <= 0.0 {
            return Err(FeedError::Unavailable(format!("zero volume history for {}", symbol)));
        }
        Ok(avg)
    }

    async fn get_recent_news(
        &self,
        symbol: &str,
        window_hours: u32,
    ) -> FeedResult<Vec<NewsArticle>> {
        let since = Utc::now() - Duration::hours(i64::from(window_hours));
        let resp: NewsResponse = self
            .get_json(
                "/v2/reference/news",
                &[
                    ("ticker", symbol.to_string()),
                    ("published_utc.gte", since.to_rfc3339()),
                    ("limit", "50".to_string()),
                ],
            )
            .await?;

        let articles = resp
            .results
            .into_iter()
            .map(|item| {
                let sentiment = item
                    .insights
                    .iter()
                    .find(|i| i.ticker.eq_ignore_ascii_case(symbol))
                    .and_then(|i| parse_sentiment(&i.sentiment));
                NewsArticle {
                    headline: item.title,
                    summary: item.description.unwrap_or_default(),
                    sentiment,
                    published_at: item.published_utc,
                }
            })
            .collect();

        Ok(articles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_parsing() {
        let json = r#"{
            "status": "OK",
            "ticker": {
                "ticker": "AAPL",
                "todaysChangePerc": 1.5,
                "day": {"o": 150.0, "c": 152.0, "v": 1200000},
                "lastTrade": {"p": 152.34},
                "prevDay": {"c": 150.1, "v": 900000}
            }
        }"#;
        let resp: SnapshotResponse = serde_json::from_str(json).unwrap();
        let ticker = resp.ticker.unwrap();
        assert_eq!(ticker.last_trade.unwrap().p, 152.34);
        assert_eq!(ticker.day.unwrap().v, 1_200_000.0);
        assert_eq!(ticker.todays_change_perc, 1.5);
    }

    #[test]
    fn test_news_parsing() {
        let json = r#"{
            "results": [{
                "title": "Apple announces merger",
                "description": "Details inside",
                "published_utc": "2024-05-01T12:00:00Z",
                "insights": [
                    {"ticker": "MSFT", "sentiment": "negative"},
                    {"ticker": "AAPL", "sentiment": "positive"}
                ]
            }]
        }"#;
        let resp: NewsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.results.len(), 1);
        let item = &resp.results[0];
        let sentiment = item
            .insights
            .iter()
            .find(|i| i.ticker == "AAPL")
            .and_then(|i| parse_sentiment(&i.sentiment));
        assert_eq!(sentiment, Some(Sentiment::Positive));
    }

    #[test]
    fn test_config_debug_hides_key() {
        let config = RestConfig {
            api_key: "secret".to_string(),
            ..Default::default()
        };
        assert!(!format!("{:?}", config).contains("secret"));
    }
}
