//! In-memory market data, used for simulation and tests.

use crate::error::{FeedError, FeedResult};
use crate::provider::MarketDataProvider;
use async_trait::async_trait;
use dashmap::DashMap;
use sentinel_core::{LookbackPeriod, NewsArticle, Quote};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Thread-safe market data held in memory.
///
/// Every lookup is counted so callers can verify fetch batching.
#[derive(Debug, Clone, Default)]
pub struct StaticMarketData {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    quotes: DashMap<String, Quote>,
    reference_prices: DashMap<(String, LookbackPeriod), f64>,
    average_volumes: DashMap<(String, u32), f64>,
    news: DashMap<String, Vec<NewsArticle>>,
    quote_calls: DashMap<String, usize>,
    total_quote_calls: AtomicUsize,
    historical_calls: AtomicUsize,
    volume_calls: AtomicUsize,
    news_calls: AtomicUsize,
    unreachable: AtomicBool,
    latency_ms: AtomicU64,
}

impl StaticMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_quote(&self, symbol: &str, quote: Quote) {
        self.inner.quotes.insert(symbol.to_uppercase(), quote);
    }

    /// Update only the price of an existing quote, or create a bare one.
    pub fn set_price(&self, symbol: &str, price: f64) {
        self.inner
            .quotes
            .entry(symbol.to_uppercase())
            .and_modify(|q| q.price = price)
            .or_insert(Quote {
                price,
                change_pct: 0.0,
                volume: 0.0,
                avg_volume: None,
            });
    }

    pub fn remove_quote(&self, symbol: &str) {
        self.inner.quotes.remove(&symbol.to_uppercase());
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.inner.quotes.get(&symbol.to_uppercase()).map(|q| *q)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.quotes.iter().map(|r| r.key().clone()).collect()
    }

    pub fn set_historical_price(&self, symbol: &str, period: LookbackPeriod, price: f64) {
        self.inner
            .reference_prices
            .insert((symbol.to_uppercase(), period), price);
    }

    pub fn set_average_volume(&self, symbol: &str, days: u32, volume: f64) {
        self.inner
            .average_volumes
            .insert((symbol.to_uppercase(), days), volume);
    }

    pub fn set_news(&self, symbol: &str, articles: Vec<NewsArticle>) {
        self.inner.news.insert(symbol.to_uppercase(), articles);
    }

    /// Simulate a full provider outage.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to every lookup.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Quote lookups made for `symbol`.
    pub fn quote_calls(&self, symbol: &str) -> usize {
        self.inner
            .quote_calls
            .get(&symbol.to_uppercase())
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn total_quote_calls(&self) -> usize {
        self.inner.total_quote_calls.load(Ordering::SeqCst)
    }

    pub fn historical_calls(&self) -> usize {
        self.inner.historical_calls.load(Ordering::SeqCst)
    }

    pub fn volume_calls(&self) -> usize {
        self.inner.volume_calls.load(Ordering::SeqCst)
    }

    pub fn news_calls(&self) -> usize {
        self.inner.news_calls.load(Ordering::SeqCst)
    }

    async fn simulate_io(&self) -> FeedResult<()> {
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(FeedError::ConnectionFailed("provider offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketData {
    async fn get_quote(&self, symbol: &str) -> FeedResult<Quote> {
        let key = symbol.to_uppercase();
        *self.inner.quote_calls.entry(key.clone()).or_insert(0) += 1;
        self.inner.total_quote_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        self.inner
            .quotes
            .get(&key)
            .map(|q| *q)
            .ok_or_else(|| FeedError::Unavailable(format!("no quote for {}", key)))
    }

    async fn get_historical_price(&self, symbol: &str, period: LookbackPeriod) -> FeedResult<f64> {
        self.inner.historical_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        let key = (symbol.to_uppercase(), period);
        self.inner
            .reference_prices
            .get(&key)
            .map(|p| *p)
            .ok_or_else(|| {
                FeedError::Unavailable(format!("no {} reference for {}", period.as_str(), key.0))
            })
    }

    async fn get_average_volume(&self, symbol: &str, days: u32) -> FeedResult<f64> {
        self.inner.volume_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        let key = (symbol.to_uppercase(), days);
        self.inner
            .average_volumes
            .get(&key)
            .map(|v| *v)
            .ok_or_else(|| FeedError::Unavailable(format!("no {}d volume for {}", days, key.0)))
    }

    async fn get_recent_news(
        &self,
        symbol: &str,
        _window_hours: u32,
    ) -> FeedResult<Vec<NewsArticle>> {
        self.inner.news_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_io().await?;

        Ok(self
            .inner
            .news
            .get(&symbol.to_uppercase())
            .map(|n| n.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(price: f64) -> Quote {
        Quote {
            price,
            change_pct: 0.0,
            volume: 100.0,
            avg_volume: Some(80.0),
        }
    }

    #[tokio::test]
    async fn test_quote_lookup_and_counting() {
        let data = StaticMarketData::new();
        data.set_quote("aapl", quote(150.0));

        let q = data.get_quote("AAPL").await.unwrap();
        assert_eq!(q.price, 150.0);
        let _ = data.get_quote("AAPL").await;
        assert_eq!(data.quote_calls("aapl"), 2);
        assert_eq!(data.total_quote_calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_symbol_is_unavailable() {
        let data = StaticMarketData::new();
        let err = data.get_quote("NOPE").await.unwrap_err();
        assert!(err.is_unavailable());
        let err = data
            .get_historical_price("NOPE", LookbackPeriod::OneDay)
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_unreachable() {
        let data = StaticMarketData::new();
        data.set_quote("AAPL", quote(1.0));
        data.set_unreachable(true);
        let err = data.get_quote("AAPL").await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn test_set_price_keeps_volume() {
        let data = StaticMarketData::new();
        data.set_quote("AAPL", quote(150.0));
        data.set_price("AAPL", 155.0);
        let q = data.quote("AAPL").unwrap();
        assert_eq!(q.price, 155.0);
        assert_eq!(q.volume, 100.0);
    }
}
