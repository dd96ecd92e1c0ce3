//! Gap planning: decide what each ticker still needs and group tickers that
//! can share one fetch.

use crate::calendar::SessionBoundary;
use crate::domain::Ticker;
use crate::store::{PriceStore, StoreError};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Latest stored session per ticker for the current run.
///
/// `None` means nothing is stored and the full history must be fetched.
/// Derived from the store at the start of every run and never cached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    boundaries: BTreeMap<Ticker, Option<NaiveDate>>,
}

impl SyncState {
    /// Query the store for every requested ticker.
    pub fn collect(store: &dyn PriceStore, tickers: &[Ticker]) -> Result<Self, StoreError> {
        let mut boundaries = BTreeMap::new();
        for ticker in tickers {
            if boundaries.contains_key(ticker) {
                continue;
            }
            let latest = store.latest_date(ticker)?;
            tracing::debug!(%ticker, latest = ?latest, "stored boundary");
            boundaries.insert(ticker.clone(), latest);
        }
        Ok(Self { boundaries })
    }

    pub fn boundary(&self, ticker: &Ticker) -> Option<Option<NaiveDate>> {
        self.boundaries.get(ticker).copied()
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Group tickers by identical boundary and split the groups into batches
    /// to fetch and batches that are already up to date.
    ///
    /// Batches come out with the full-history batch first, then ascending
    /// boundary dates. Tickers inside a batch are sorted.
    pub fn plan(&self, end: SessionBoundary, today: NaiveDate) -> SyncPlan {
        let mut groups: BTreeMap<Option<NaiveDate>, Vec<Ticker>> = BTreeMap::new();
        for (ticker, boundary) in &self.boundaries {
            groups.entry(*boundary).or_default().push(ticker.clone());
        }

        let mut plan = SyncPlan {
            end,
            today,
            batches: Vec::new(),
            skipped: Vec::new(),
        };
        for (start, tickers) in groups {
            let batch = FetchBatch { start, tickers };
            if batch.is_up_to_date(&end, today) {
                plan.skipped.push(batch);
            } else {
                plan.batches.push(batch);
            }
        }
        plan
    }
}

impl FromIterator<(Ticker, Option<NaiveDate>)> for SyncState {
    fn from_iter<I: IntoIterator<Item = (Ticker, Option<NaiveDate>)>>(iter: I) -> Self {
        Self {
            boundaries: iter.into_iter().collect(),
        }
    }
}

/// Tickers that share an exclusive start date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchBatch {
    /// Exclusive start. `None` fetches the whole history.
    pub start: Option<NaiveDate>,
    pub tickers: Vec<Ticker>,
}

impl FetchBatch {
    /// Whether there is nothing to fetch for this batch.
    ///
    /// A stored boundary that is not before today's exchange-local date, or
    /// that already reaches the end session, leaves no completed session
    /// after it. A full-history batch is never up to date.
    pub fn is_up_to_date(&self, end: &SessionBoundary, today: NaiveDate) -> bool {
        match self.start {
            None => false,
            Some(start) => start >= today || start >= end.session_date,
        }
    }
}

/// Batches for one run, all sharing the same end session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncPlan {
    pub end: SessionBoundary,
    pub today: NaiveDate,
    /// Batches that need a fetch, in execution order.
    pub batches: Vec<FetchBatch>,
    pub skipped: Vec<FetchBatch>,
}

impl SyncPlan {
    pub fn ticker_count(&self) -> usize {
        self.batches
            .iter()
            .chain(&self.skipped)
            .map(|b| b.tickers.len())
            .sum()
    }

    pub fn is_noop(&self) -> bool {
        self.batches.is_empty()
    }
}
