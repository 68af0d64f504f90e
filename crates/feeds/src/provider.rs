//! Market data provider contract.

use crate::error::FeedResult;
use async_trait::async_trait;
use sentinel_core::{LookbackPeriod, NewsArticle, Quote};

/// Source of quotes, reference prices and news for a symbol.
///
/// Implementations must return [`FeedError::Unavailable`](crate::FeedError::Unavailable)
/// when they have no answer, never a zeroed value.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Current quote.
    async fn get_quote(&self, symbol: &str) -> FeedResult<Quote>;

    /// Reference price at the start of `period`.
    async fn get_historical_price(&self, symbol: &str, period: LookbackPeriod) -> FeedResult<f64>;

    /// Average daily volume over the last `days` sessions.
    async fn get_average_volume(&self, symbol: &str, days: u32) -> FeedResult<f64>;

    /// Articles published within the last `window_hours`.
    async fn get_recent_news(&self, symbol: &str, window_hours: u32)
        -> FeedResult<Vec<NewsArticle>>;
}
