//! Incremental sync: gap planning, batch fetching, merging.
//!
//! A run recomputes per-ticker state from the store, groups tickers that
//! share a resume point into batches, fetches each batch with one source
//! call, and merges the cleaned rows back. Nothing here is persisted
//! between runs.

pub mod engine;
pub mod orchestrator;
pub mod planner;
pub mod progress;

pub use engine::{SyncEngine, SyncReport};
pub use orchestrator::{BatchReport, Orchestrator};
pub use planner::{FetchBatch, SyncPlan, SyncState};
pub use progress::{LogProgress, NoProgress, SyncProgress};

use crate::domain::Ticker;
use crate::source::DataError;
use crate::store::StoreError;
use crate::universe::UniverseError;
use thiserror::Error;

/// Errors that abort a sync run. Batches merged before the failure stay merged.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error for {ticker}: {source}")]
    Store { ticker: Ticker, source: StoreError },

    #[error("store error: {0}")]
    StoreScan(#[from] StoreError),

    #[error("fetch failed for batch [{}]: {source}", join(.tickers))]
    Fetch {
        tickers: Vec<Ticker>,
        source: DataError,
    },

    #[error("universe error: {0}")]
    Universe(#[from] UniverseError),

    #[error("no completed session found before {0}")]
    Calendar(String),
}

fn join(tickers: &[Ticker]) -> String {
    tickers
        .iter()
        .map(Ticker::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
