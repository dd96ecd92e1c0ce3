//! Read side of a price store: per-ticker history and store status.

use super::{PriceStore, StoreError};
use crate::domain::{PriceRow, Ticker};
use chrono::NaiveDate;
use serde::Serialize;

/// Stored extent of one requested ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub ticker: Ticker,
    pub stored: bool,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    pub rows: usize,
}

/// Read-only view over any store backend.
pub struct PriceReader<'a> {
    store: &'a dyn PriceStore,
}

impl<'a> PriceReader<'a> {
    pub fn new(store: &'a dyn PriceStore) -> Self {
        Self { store }
    }

    /// Full history, ascending by date.
    pub fn load(&self, ticker: &Ticker) -> Result<Vec<PriceRow>, StoreError> {
        self.store.load(ticker)
    }

    /// History restricted to `[start, end]`; either bound may be open.
    pub fn load_range(
        &self,
        ticker: &Ticker,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<PriceRow>, StoreError> {
        let rows = self.store.load(ticker)?;
        Ok(rows
            .into_iter()
            .filter(|r| start.map_or(true, |s| r.date >= s))
            .filter(|r| end.map_or(true, |e| r.date <= e))
            .collect())
    }

    /// The most recent `n` rows, still ascending.
    pub fn tail(&self, ticker: &Ticker, n: usize) -> Result<Vec<PriceRow>, StoreError> {
        self.tail_range(ticker, None, None, n)
    }

    /// The last `n` rows inside `[start, end]`.
    pub fn tail_range(
        &self,
        ticker: &Ticker,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        n: usize,
    ) -> Result<Vec<PriceRow>, StoreError> {
        let mut rows = self.load_range(ticker, start, end)?;
        let skip = rows.len().saturating_sub(n);
        rows.drain(..skip);
        Ok(rows)
    }

    /// Status for each ticker, in the order given.
    pub fn status(&self, tickers: &[Ticker]) -> Result<Vec<StoreStatus>, StoreError> {
        tickers
            .iter()
            .map(|ticker| {
                let summary = self.store.summary(ticker)?;
                Ok(StoreStatus {
                    ticker: ticker.clone(),
                    stored: summary.is_some(),
                    first_date: summary.as_ref().map(|s| s.first_date),
                    last_date: summary.as_ref().map(|s| s.last_date),
                    rows: summary.map_or(0, |s| s.rows),
                })
            })
            .collect()
    }

    /// Status for every ticker the store holds.
    pub fn status_all(&self) -> Result<Vec<StoreStatus>, StoreError> {
        let tickers = self.store.tickers()?;
        self.status(&tickers)
    }
}
