//! Fetch orchestration: one source call per batch, response normalization,
//! row cleaning, and per-ticker merges.

use super::planner::FetchBatch;
use super::SyncError;
use crate::calendar::SessionBoundary;
use crate::domain::{PriceRow, Ticker};
use crate::source::{DataError, FetchRequest, FetchResponse, PriceSource, SourceBar};
use crate::store::{dedup_by_date, MergeOutcome, PriceStore};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Result of one fetched batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub start: Option<NaiveDate>,
    pub merged: BTreeMap<Ticker, MergeOutcome>,
    /// Tickers for which the source had no usable rows.
    pub empty: Vec<Ticker>,
}

impl BatchReport {
    pub fn rows_written(&self) -> usize {
        self.merged.values().map(MergeOutcome::written).sum()
    }
}

/// Runs batches against a source and a store.
pub struct Orchestrator<'a> {
    store: &'a dyn PriceStore,
    source: &'a dyn PriceSource,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a dyn PriceStore, source: &'a dyn PriceSource) -> Self {
        Self { store, source }
    }

    /// Fetch one batch with a single source call and merge every ticker's
    /// cleaned rows. Each merge commits on its own.
    pub fn run_batch(
        &self,
        batch: &FetchBatch,
        end: &SessionBoundary,
    ) -> Result<BatchReport, SyncError> {
        let fetch_failed = |source: DataError| SyncError::Fetch {
            tickers: batch.tickers.clone(),
            source,
        };

        if !self.source.is_available() {
            return Err(fetch_failed(DataError::CircuitBreakerTripped));
        }

        let request = FetchRequest {
            tickers: batch.tickers.clone(),
            after: batch.start,
            end: *end,
        };
        let response = self.source.fetch(&request).map_err(fetch_failed)?;
        let mut by_ticker = normalize_response(&batch.tickers, response).map_err(fetch_failed)?;

        let mut report = BatchReport {
            start: batch.start,
            ..Default::default()
        };
        for ticker in &batch.tickers {
            let bars = by_ticker.remove(ticker).unwrap_or_default();
            let rows = clean_rows(bars, batch.start, end.session_date);
            if rows.is_empty() {
                tracing::debug!(%ticker, "no new rows");
                report.empty.push(ticker.clone());
                continue;
            }
            let partial = rows.iter().filter(|r| !r.is_complete()).count();
            if partial > 0 {
                tracing::warn!(%ticker, partial, "rows with missing prices stored as NaN");
            }

            let outcome = self
                .store
                .merge(ticker, &rows)
                .map_err(|source| SyncError::Store {
                    ticker: ticker.clone(),
                    source,
                })?;
            tracing::debug!(
                %ticker,
                rows = rows.len(),
                inserted = outcome.inserted,
                updated = outcome.updated,
                "merged"
            );
            report.merged.insert(ticker.clone(), outcome);
        }

        tracing::info!(
            start = ?batch.start,
            tickers = batch.tickers.len(),
            written = report.rows_written(),
            empty = report.empty.len(),
            "batch synced"
        );
        Ok(report)
    }
}

/// Attribute a response to the batch's tickers.
///
/// A response without a ticker dimension belongs to the batch's only ticker;
/// for a multi-ticker batch it cannot be attributed and is rejected. Keys
/// outside the batch are dropped. Batch tickers the source did not mention
/// get an empty row set.
pub fn normalize_response(
    batch: &[Ticker],
    response: FetchResponse,
) -> Result<BTreeMap<Ticker, Vec<SourceBar>>, DataError> {
    let mut by_ticker: BTreeMap<Ticker, Vec<SourceBar>> = match response {
        FetchResponse::Single(bars) => match batch {
            [only] => BTreeMap::from([(only.clone(), bars)]),
            [] if bars.is_empty() => BTreeMap::new(),
            _ => {
                return Err(DataError::ResponseFormatChanged(format!(
                    "single-ticker response for a batch of {} tickers",
                    batch.len()
                )))
            }
        },
        FetchResponse::Multi(map) => map
            .into_iter()
            .filter(|(ticker, _)| {
                let known = batch.contains(ticker);
                if !known {
                    tracing::warn!(%ticker, "dropping response for ticker outside the batch");
                }
                known
            })
            .collect(),
    };

    for ticker in batch {
        by_ticker.entry(ticker.clone()).or_default();
    }
    Ok(by_ticker)
}

/// Turn raw bars into stored rows.
///
/// Drops fully empty bars and bars outside `(after, end]`, keeps the last bar
/// for a repeated date, sorts by date. Missing prices become NaN, a missing
/// volume becomes 0. The adjusted close is not carried over.
pub fn clean_rows(bars: Vec<SourceBar>, after: Option<NaiveDate>, end: NaiveDate) -> Vec<PriceRow> {
    let rows: Vec<PriceRow> = bars
        .into_iter()
        .filter(|bar| !bar.is_empty())
        .filter(|bar| after.map_or(true, |a| bar.date > a) && bar.date <= end)
        .map(|bar| PriceRow {
            date: bar.date,
            open: bar.open.unwrap_or(f64::NAN),
            high: bar.high.unwrap_or(f64::NAN),
            low: bar.low.unwrap_or(f64::NAN),
            close: bar.close.unwrap_or(f64::NAN),
            volume: bar.volume.unwrap_or(0),
        })
        .collect();
    dedup_by_date(&rows)
}
