//! Progress callbacks for a sync run.

use super::orchestrator::BatchReport;
use super::planner::{FetchBatch, SyncPlan};
use super::SyncError;

/// Progress callback for multi-batch runs.
pub trait SyncProgress: Send + Sync {
    /// Called once the plan is known, before any fetch.
    fn on_plan(&self, plan: &SyncPlan);

    /// Called when starting to fetch a batch.
    fn on_batch_start(&self, batch: &FetchBatch, index: usize, total: usize);

    /// Called when a batch fetch completes.
    fn on_batch_complete(
        &self,
        batch: &FetchBatch,
        index: usize,
        total: usize,
        result: &Result<BatchReport, SyncError>,
    );

    /// Called when the whole run is done.
    fn on_run_complete(&self, fetched: usize, skipped: usize, rows_written: usize);
}

/// Reports progress through `tracing`.
pub struct LogProgress;

impl SyncProgress for LogProgress {
    fn on_plan(&self, plan: &SyncPlan) {
        tracing::info!(
            end = %plan.end.session_date,
            tickers = plan.ticker_count(),
            batches = plan.batches.len(),
            skipped = plan.skipped.len(),
            "sync planned"
        );
        for batch in &plan.skipped {
            tracing::info!(start = ?batch.start, tickers = batch.tickers.len(), "already up to date");
        }
    }

    fn on_batch_start(&self, batch: &FetchBatch, index: usize, total: usize) {
        tracing::info!(
            "[{}/{}] fetching {} ticker(s) after {}",
            index + 1,
            total,
            batch.tickers.len(),
            batch
                .start
                .map_or_else(|| "the beginning".to_string(), |d| d.to_string())
        );
    }

    fn on_batch_complete(
        &self,
        batch: &FetchBatch,
        index: usize,
        total: usize,
        result: &Result<BatchReport, SyncError>,
    ) {
        match result {
            Ok(report) => tracing::debug!(
                "[{}/{}] ok: {} rows written",
                index + 1,
                total,
                report.rows_written()
            ),
            Err(e) => tracing::error!(
                start = ?batch.start,
                "[{}/{}] failed: {e}",
                index + 1,
                total
            ),
        }
    }

    fn on_run_complete(&self, fetched: usize, skipped: usize, rows_written: usize) {
        tracing::info!(fetched, skipped, rows_written, "sync complete");
    }
}

/// Discards all progress events.
pub struct NoProgress;

impl SyncProgress for NoProgress {
    fn on_plan(&self, _plan: &SyncPlan) {}

    fn on_batch_start(&self, _batch: &FetchBatch, _index: usize, _total: usize) {}

    fn on_batch_complete(
        &self,
        _batch: &FetchBatch,
        _index: usize,
        _total: usize,
        _result: &Result<BatchReport, SyncError>,
    ) {
    }

    fn on_run_complete(&self, _fetched: usize, _skipped: usize, _rows_written: usize) {}
}
