//! Sync engine: plan a run against the store and execute its batches.

use super::orchestrator::{BatchReport, Orchestrator};
use super::planner::{SyncPlan, SyncState};
use super::progress::{NoProgress, SyncProgress};
use super::SyncError;
use crate::calendar::{MarketCalendar, SessionBoundary};
use crate::config::SyncOptions;
use crate::domain::Ticker;
use crate::source::PriceSource;
use crate::store::{MergeOutcome, PriceStore};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub end: SessionBoundary,
    pub batches_fetched: usize,
    pub batches_skipped: usize,
    pub remote_calls: usize,
    pub merged: BTreeMap<Ticker, MergeOutcome>,
    /// Fetched tickers the source returned nothing new for.
    pub empty: Vec<Ticker>,
    /// Tickers in skipped batches.
    pub up_to_date: Vec<Ticker>,
}

impl SyncReport {
    fn new(plan: &SyncPlan) -> Self {
        Self {
            end: plan.end,
            batches_fetched: 0,
            batches_skipped: plan.skipped.len(),
            remote_calls: 0,
            merged: BTreeMap::new(),
            empty: Vec::new(),
            up_to_date: plan
                .skipped
                .iter()
                .flat_map(|b| b.tickers.iter().cloned())
                .collect(),
        }
    }

    /// Fold in a completed batch. A batch only completes after its one
    /// source call, so this is also where remote calls are counted.
    fn absorb(&mut self, batch: BatchReport) {
        self.batches_fetched += 1;
        self.remote_calls += 1;
        self.merged.extend(batch.merged);
        self.empty.extend(batch.empty);
    }

    pub fn rows_written(&self) -> usize {
        self.merged.values().map(MergeOutcome::written).sum()
    }
}

/// Incremental daily price sync over one store, one source, one calendar.
pub struct SyncEngine<'a> {
    store: &'a dyn PriceStore,
    source: &'a dyn PriceSource,
    calendar: &'a dyn MarketCalendar,
    options: SyncOptions,
    progress: &'a dyn SyncProgress,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a dyn PriceStore,
        source: &'a dyn PriceSource,
        calendar: &'a dyn MarketCalendar,
    ) -> Self {
        Self {
            store,
            source,
            calendar,
            options: SyncOptions::default(),
            progress: &NoProgress,
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn SyncProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Plan a run as of `now` without fetching anything.
    pub fn plan_at(&self, tickers: &[Ticker], now: DateTime<Utc>) -> Result<SyncPlan, SyncError> {
        let end = self
            .calendar
            .last_completed_session(now)
            .ok_or_else(|| SyncError::Calendar(now.to_rfc3339()))?;
        let today = self.calendar.today(now);
        let state = SyncState::collect(self.store, tickers)?;
        Ok(state.plan(end, today))
    }

    /// Sync `tickers` through the last session completed before now.
    pub fn run(&self, tickers: &[Ticker]) -> Result<SyncReport, SyncError> {
        self.run_at(tickers, Utc::now())
    }

    /// Sync `tickers` as of `now`.
    ///
    /// The first failing batch aborts the run; batches merged before it stay
    /// merged. In parallel mode every batch runs and the first error in plan
    /// order is returned.
    pub fn run_at(&self, tickers: &[Ticker], now: DateTime<Utc>) -> Result<SyncReport, SyncError> {
        let plan = self.plan_at(tickers, now)?;
        self.progress.on_plan(&plan);

        let mut report = SyncReport::new(&plan);
        let orchestrator = Orchestrator::new(self.store, self.source);
        let total = plan.batches.len();
        let run_one = |index: usize| {
            let batch = &plan.batches[index];
            self.progress.on_batch_start(batch, index, total);
            let result = orchestrator.run_batch(batch, &plan.end);
            self.progress.on_batch_complete(batch, index, total, &result);
            result
        };

        if self.options.parallel {
            let results: Vec<Result<BatchReport, SyncError>> =
                (0..total).into_par_iter().map(run_one).collect();
            for result in results {
                report.absorb(result?);
            }
        } else {
            for index in 0..total {
                report.absorb(run_one(index)?);
            }
        }

        self.progress.on_run_complete(
            report.batches_fetched,
            report.batches_skipped,
            report.rows_written(),
        );
        Ok(report)
    }
}
