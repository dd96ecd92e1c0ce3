//! Remote price source trait, request/response shapes, and error types.
//!
//! The `PriceSource` trait abstracts over where daily bars come from so the
//! orchestrator can be exercised against a recording mock in tests. A source
//! receives a whole batch of tickers in one call; how it satisfies that call
//! (one HTTP request, several, a local file) is its own business.

pub mod circuit_breaker;
pub mod yahoo;

pub use circuit_breaker::CircuitBreaker;
pub use yahoo::YahooSource;

use crate::calendar::SessionBoundary;
use crate::domain::Ticker;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Raw daily bar as delivered by a source, before cleaning.
///
/// Every value column is nullable: sources pad ranges with empty rows for
/// days a symbol did not trade. `adj_close` is carried by some sources but is
/// not part of the stored row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceBar {
    pub date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<u64>,
    pub adj_close: Option<f64>,
}

impl SourceBar {
    /// A bar with every OHLCV column missing (non-trading day, delisted mid-range).
    pub fn is_empty(&self) -> bool {
        self.open.is_none()
            && self.high.is_none()
            && self.low.is_none()
            && self.close.is_none()
            && self.volume.is_none()
    }
}

/// One fetch for one batch: every ticker shares the same range.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub tickers: Vec<Ticker>,
    /// Exclusive start. `None` means "from the beginning of history".
    pub after: Option<NaiveDate>,
    /// Inclusive end: the close of the last completed session.
    pub end: SessionBoundary,
}

/// A source response.
///
/// Sources that answer a single-ticker request without a ticker dimension
/// return `Single`; the orchestrator attributes it to the batch's only ticker.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResponse {
    Single(Vec<SourceBar>),
    Multi(BTreeMap<Ticker, Vec<SourceBar>>),
}

impl FetchResponse {
    pub fn is_empty(&self) -> bool {
        match self {
            FetchResponse::Single(bars) => bars.is_empty(),
            FetchResponse::Multi(map) => map.values().all(|bars| bars.is_empty()),
        }
    }
}

/// Structured error types for remote data operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("rate limited by source (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("hard stop: price source has blocked requests (circuit breaker tripped)")]
    CircuitBreakerTripped,

    #[error("data error: {0}")]
    Other(String),
}

/// Trait for remote daily price sources.
pub trait PriceSource: Send + Sync {
    /// Human-readable name of this source.
    fn name(&self) -> &str;

    /// Fetch daily bars for every ticker in the request, strictly after
    /// `after` through the session at `end`.
    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, DataError>;

    /// Check if the source is currently available (not rate-limited, not blocked).
    fn is_available(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bar_detection_ignores_adj_close() {
        let bar = SourceBar {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            adj_close: Some(1.0),
            ..Default::default()
        };
        assert!(bar.is_empty());

        let traded = SourceBar {
            volume: Some(0),
            ..bar
        };
        assert!(!traded.is_empty());
    }

    #[test]
    fn multi_response_with_only_empty_sets_is_empty() {
        let mut map = BTreeMap::new();
        map.insert(Ticker::new("AAA"), Vec::new());
        assert!(FetchResponse::Multi(map).is_empty());
        assert!(FetchResponse::Single(Vec::new()).is_empty());
    }
}
