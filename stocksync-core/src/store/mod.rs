//! Price stores.
//!
//! `PriceStore` is the only capability the sync engine needs from storage:
//! "what is the latest stored session per ticker" and "merge these rows".
//! Two backends implement it: a relational table (`SqliteStore`) and a
//! per-ticker document store (`ParquetStore`). `StoreBackend` is the closed
//! set of the two, chosen once from configuration.

pub mod parquet;
pub mod reader;
pub mod sqlite;

pub use parquet::ParquetStore;
pub use reader::{PriceReader, StoreStatus};
pub use sqlite::SqliteStore;

use crate::config::StoreConfig;
use crate::domain::{PriceRow, Ticker};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("parquet I/O error: {0}")]
    Parquet(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Meta(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// What a merge did to the stored rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Rows for dates that were not stored before.
    pub inserted: usize,
    /// Rows for stored dates whose values changed.
    pub updated: usize,
    /// Rows identical to what was already stored.
    pub unchanged: usize,
}

impl MergeOutcome {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Stored extent of one ticker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickerSummary {
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub rows: usize,
}

/// Storage capability used by the sync engine and the reader.
///
/// Implementations must be safe under concurrent merges for different
/// tickers. Merges for the same ticker are never issued concurrently.
pub trait PriceStore: Send + Sync {
    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Latest stored session date, or `None` when the ticker has no rows.
    fn latest_date(&self, ticker: &Ticker) -> Result<Option<NaiveDate>, StoreError>;

    /// Upsert rows keyed by (ticker, date). Merging the same rows twice
    /// leaves the store exactly as merging them once.
    fn merge(&self, ticker: &Ticker, rows: &[PriceRow]) -> Result<MergeOutcome, StoreError>;

    /// All stored rows, ascending by date, one per date. Unknown tickers
    /// yield an empty vector.
    fn load(&self, ticker: &Ticker) -> Result<Vec<PriceRow>, StoreError>;

    /// Every ticker with at least one stored row, sorted.
    fn tickers(&self) -> Result<Vec<Ticker>, StoreError>;

    /// First/last date and row count, or `None` when nothing is stored.
    fn summary(&self, ticker: &Ticker) -> Result<Option<TickerSummary>, StoreError> {
        let rows = self.load(ticker)?;
        Ok(match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => Some(TickerSummary {
                first_date: first.date,
                last_date: last.date,
                rows: rows.len(),
            }),
            _ => None,
        })
    }
}

/// The configured store backend.
pub enum StoreBackend {
    Sqlite(SqliteStore),
    Parquet(ParquetStore),
}

impl StoreBackend {
    /// Open the backend described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        match config {
            StoreConfig::Sqlite {
                path,
                table,
                chunk_rows,
            } => Ok(StoreBackend::Sqlite(SqliteStore::open(
                path,
                table,
                *chunk_rows,
            )?)),
            StoreConfig::Parquet { dir } => Ok(StoreBackend::Parquet(ParquetStore::open(dir)?)),
        }
    }

    fn inner(&self) -> &dyn PriceStore {
        match self {
            StoreBackend::Sqlite(store) => store,
            StoreBackend::Parquet(store) => store,
        }
    }
}

impl PriceStore for StoreBackend {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn latest_date(&self, ticker: &Ticker) -> Result<Option<NaiveDate>, StoreError> {
        self.inner().latest_date(ticker)
    }

    fn merge(&self, ticker: &Ticker, rows: &[PriceRow]) -> Result<MergeOutcome, StoreError> {
        self.inner().merge(ticker, rows)
    }

    fn load(&self, ticker: &Ticker) -> Result<Vec<PriceRow>, StoreError> {
        self.inner().load(ticker)
    }

    fn tickers(&self) -> Result<Vec<Ticker>, StoreError> {
        self.inner().tickers()
    }

    fn summary(&self, ticker: &Ticker) -> Result<Option<TickerSummary>, StoreError> {
        self.inner().summary(ticker)
    }
}

/// Sort rows by date and keep the last row for any repeated date.
pub(crate) fn dedup_by_date(rows: &[PriceRow]) -> Vec<PriceRow> {
    let by_date: BTreeMap<NaiveDate, &PriceRow> = rows.iter().map(|r| (r.date, r)).collect();
    by_date.into_values().cloned().collect()
}
