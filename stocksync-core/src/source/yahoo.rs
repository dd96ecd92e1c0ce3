//! Yahoo Finance price source.
//!
//! Fetches daily bars from Yahoo's v8 chart API. The chart endpoint is
//! per-symbol, so one batch fetch issues one HTTP request per ticker; from the
//! orchestrator's point of view it is still a single source call. Handles rate
//! limiting, retries with exponential backoff and jitter, and the circuit
//! breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; parse failures surface as `DataError::ResponseFormatChanged`.

use super::circuit_breaker::CircuitBreaker;
use super::{DataError, FetchRequest, FetchResponse, PriceSource, SourceBar};
use crate::config::SourceConfig;
use crate::domain::Ticker;
use chrono::{DateTime, NaiveDate};
use rand::Rng;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Earliest date requested for a full-history backfill.
const HISTORY_START: (i32, u32, u32) = (1900, 1, 1);

/// Upper bound on the exponential part of a retry delay.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: Option<ChartMeta>,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    gmtoffset: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

/// Yahoo Finance price source.
pub struct YahooSource {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooSource {
    pub fn new(
        circuit_breaker: Arc<CircuitBreaker>,
        config: &SourceConfig,
    ) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            circuit_breaker,
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
        })
    }

    /// Map exchange symbology to Yahoo's: share classes use `-` (`BRK.B` → `BRK-B`).
    pub fn yahoo_symbol(ticker: &Ticker) -> String {
        ticker.as_str().replace(['.', '/'], "-")
    }

    /// Build the chart API URL for a ticker: sessions strictly after `after`
    /// through the close at `end`.
    fn chart_url(ticker: &Ticker, after: Option<NaiveDate>, end: DateTime<chrono::Utc>) -> String {
        let first_day = after
            .and_then(|d| d.succ_opt())
            .or_else(|| NaiveDate::from_ymd_opt(HISTORY_START.0, HISTORY_START.1, HISTORY_START.2))
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp())
            .unwrap_or(0);
        let end_ts = end.timestamp();
        let symbol = Self::yahoo_symbol(ticker);
        format!(
            "https://query2.finance.yahoo.com/v8/finance/chart/{symbol}\
             ?period1={first_day}&period2={end_ts}&interval=1d\
             &includeAdjustedClose=true"
        )
    }

    /// Parse the chart API response into raw source bars.
    ///
    /// An unknown symbol is not an error: it yields no bars.
    fn parse_response(ticker: &Ticker, resp: ChartResponse) -> Result<Vec<SourceBar>, DataError> {
        let result = match (resp.chart.result, resp.chart.error) {
            (Some(result), _) => result,
            (None, Some(err)) if err.code == "Not Found" => {
                tracing::debug!(%ticker, "symbol not found at source");
                return Ok(Vec::new());
            }
            (None, Some(err)) => {
                return Err(DataError::ResponseFormatChanged(format!(
                    "{ticker}: {}: {}",
                    err.code, err.description
                )))
            }
            (None, None) => {
                return Err(DataError::ResponseFormatChanged(
                    "empty result with no error".into(),
                ))
            }
        };

        let Some(data) = result.into_iter().next() else {
            return Ok(Vec::new());
        };

        // Newly listed or fully delisted ranges come back without timestamps.
        let Some(timestamps) = data.timestamp else {
            return Ok(Vec::new());
        };

        let gmtoffset = data.meta.and_then(|m| m.gmtoffset).unwrap_or(0);

        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .ok_or_else(|| DataError::ResponseFormatChanged("no quote data".into()))?;

        let adj_closes = data
            .indicators
            .adjclose
            .and_then(|v| v.into_iter().next())
            .map(|a| a.adjclose);

        let mut bars = Vec::with_capacity(timestamps.len());
        for (i, &ts) in timestamps.iter().enumerate() {
            // Timestamps mark the session open in UTC; shift to exchange time
            // before taking the calendar date.
            let date = DateTime::from_timestamp(ts + gmtoffset, 0)
                .map(|dt| dt.naive_utc().date())
                .ok_or_else(|| {
                    DataError::ResponseFormatChanged(format!("invalid timestamp: {ts}"))
                })?;

            bars.push(SourceBar {
                date,
                open: quote.open.get(i).copied().flatten(),
                high: quote.high.get(i).copied().flatten(),
                low: quote.low.get(i).copied().flatten(),
                close: quote.close.get(i).copied().flatten(),
                volume: quote.volume.get(i).copied().flatten(),
                adj_close: adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten()),
            });
        }

        Ok(bars)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt)
    }

    /// Fetch one ticker with retry and circuit breaker logic.
    fn fetch_ticker(
        &self,
        ticker: &Ticker,
        after: Option<NaiveDate>,
        end: DateTime<chrono::Utc>,
    ) -> Result<Vec<SourceBar>, DataError> {
        let url = Self::chart_url(ticker, after, end);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                std::thread::sleep(self.backoff(attempt));
            }

            if !self.circuit_breaker.is_allowed() {
                tracing::warn!(
                    %ticker,
                    cooldown_secs = self.circuit_breaker.remaining_cooldown().as_secs(),
                    "circuit breaker open, refusing request"
                );
                return Err(DataError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!(%ticker, attempt, error = %e, "transient network error");
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();

            if status == reqwest::StatusCode::FORBIDDEN {
                self.circuit_breaker.trip();
                return Err(DataError::CircuitBreakerTripped);
            }

            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.circuit_breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                last_error = Some(DataError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }

            if status == reqwest::StatusCode::UNAUTHORIZED {
                return Err(DataError::AuthenticationRequired(
                    "Yahoo Finance requires authentication".into(),
                ));
            }

            // The chart API answers unknown symbols with 404 and a JSON body.
            if status == reqwest::StatusCode::NOT_FOUND {
                tracing::debug!(%ticker, "symbol not found at source");
                return Ok(Vec::new());
            }

            if !status.is_success() {
                self.circuit_breaker.record_failure();
                last_error = Some(DataError::Other(format!("HTTP {status} for {ticker}")));
                continue;
            }

            let chart: ChartResponse = resp.json().map_err(|e| {
                DataError::ResponseFormatChanged(format!(
                    "failed to parse response for {ticker}: {e}"
                ))
            })?;

            let bars = Self::parse_response(ticker, chart)?;
            self.circuit_breaker.record_success();
            return Ok(bars);
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

/// Exponential delay before retry `attempt` (1-based), capped at
/// `MAX_BACKOFF`, plus up to half of `base` as jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let exp = base.saturating_mul(factor).min(MAX_BACKOFF);
    let max_jitter_ms = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    exp.saturating_add(Duration::from_millis(jitter_ms))
}

impl PriceSource for YahooSource {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, DataError> {
        if let [ticker] = request.tickers.as_slice() {
            let bars = self.fetch_ticker(ticker, request.after, request.end.close)?;
            return Ok(FetchResponse::Single(bars));
        }

        let mut by_ticker = BTreeMap::new();
        for ticker in &request.tickers {
            let bars = self.fetch_ticker(ticker, request.after, request.end.close)?;
            by_ticker.insert(ticker.clone(), bars);
        }
        Ok(FetchResponse::Multi(by_ticker))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
