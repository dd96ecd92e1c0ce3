//! End-to-end sync runs against a recording in-memory price source, on both
//! store backends.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use stocksync_core::calendar::NyseCalendar;
use stocksync_core::config::SyncOptions;
use stocksync_core::source::{DataError, FetchRequest, FetchResponse, PriceSource, SourceBar};
use stocksync_core::store::{ParquetStore, PriceStore, SqliteStore, StoreBackend};
use stocksync_core::sync::{SyncEngine, SyncError};
use stocksync_core::Ticker;

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

// ── Fixtures ─────────────────────────────────────────────────────────

struct TempDir(PathBuf);

impl TempDir {
    fn new() -> Self {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!("stocksync_e2e_{}_{id}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        Self(dir)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Both backends, each fresh and empty.
fn backends() -> Vec<(StoreBackend, Option<TempDir>)> {
    let dir = TempDir::new();
    vec![
        (
            StoreBackend::Sqlite(SqliteStore::open_in_memory().unwrap()),
            None,
        ),
        (
            StoreBackend::Parquet(ParquetStore::open(&dir.0).unwrap()),
            Some(dir),
        ),
    ]
}

fn date(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
}

fn t(s: &str) -> Ticker {
    Ticker::new(s)
}

fn bar(d: u32, close: f64) -> SourceBar {
    SourceBar {
        date: date(d),
        open: Some(close - 0.5),
        high: Some(close + 1.0),
        low: Some(close - 1.0),
        close: Some(close),
        volume: Some(1_000),
        adj_close: Some(close),
    }
}

/// Thursday 2024-03-07 after the close: end session and today are both the 7th.
fn thursday_evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 7, 22, 0, 0).unwrap()
}

/// Friday 2024-03-08 before the close: end session is the 7th, today the 8th.
fn friday_morning() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 8, 15, 0, 0).unwrap()
}

/// Serves a fixed remote history and records every request.
struct RecordingSource {
    history: BTreeMap<Ticker, Vec<SourceBar>>,
    calls: Mutex<Vec<FetchRequest>>,
    fail_incremental: bool,
}

impl RecordingSource {
    fn new(history: impl IntoIterator<Item = (&'static str, Vec<SourceBar>)>) -> Self {
        Self {
            history: history.into_iter().map(|(s, bars)| (t(s), bars)).collect(),
            calls: Mutex::new(Vec::new()),
            fail_incremental: false,
        }
    }

    fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl PriceSource for RecordingSource {
    fn name(&self) -> &str {
        "recording"
    }

    fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, DataError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.fail_incremental && request.after.is_some() {
            return Err(DataError::NetworkUnreachable("connection reset".into()));
        }

        let window = |bars: &Vec<SourceBar>| -> Vec<SourceBar> {
            bars.iter()
                .filter(|b| request.after.map_or(true, |a| b.date > a))
                .filter(|b| b.date <= request.end.session_date)
                .cloned()
                .collect()
        };

        if let [only] = request.tickers.as_slice() {
            let bars = self.history.get(only).map(window).unwrap_or_default();
            return Ok(FetchResponse::Single(bars));
        }
        Ok(FetchResponse::Multi(
            request
                .tickers
                .iter()
                .filter_map(|ticker| Some((ticker.clone(), window(self.history.get(ticker)?))))
                .collect(),
        ))
    }

    fn is_available(&self) -> bool {
        true
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn first_run_stores_full_history_and_rerun_is_stable() {
    for (store, _dir) in backends() {
        let source = RecordingSource::new([("AAA", vec![bar(4, 10.0), bar(5, 11.0), bar(6, 12.0)])]);
        let calendar = NyseCalendar::new();
        let engine = SyncEngine::new(&store, &source, &calendar);

        let report = engine.run_at(&[t("AAA")], thursday_evening()).unwrap();
        assert_eq!(report.batches_fetched, 1);
        assert_eq!(report.rows_written(), 3, "backend {}", store.name());

        let first = store.load(&t("AAA")).unwrap();
        let dates: Vec<NaiveDate> = first.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(4), date(5), date(6)]);

        let again = engine.run_at(&[t("AAA")], thursday_evening()).unwrap();
        assert_eq!(again.rows_written(), 0);
        assert_eq!(again.empty, vec![t("AAA")]);
        assert_eq!(store.load(&t("AAA")).unwrap(), first);

        let calls = source.calls();
        assert_eq!(calls[0].after, None);
        assert_eq!(calls[1].after, Some(date(6)));
    }
}

#[test]
fn distinct_boundaries_make_one_call_per_batch() {
    for (store, _dir) in backends() {
        store.merge(&t("BBB"), &[clean(4), clean(5)]).unwrap();

        let source = RecordingSource::new([
            ("AAA", vec![bar(4, 10.0), bar(5, 11.0), bar(6, 12.0)]),
            ("BBB", vec![bar(4, 20.0), bar(5, 21.0), bar(6, 22.0)]),
        ]);
        let calendar = NyseCalendar::new();
        let report = SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("AAA"), t("BBB")], thursday_evening())
            .unwrap();

        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(report.remote_calls, 2);
        assert_eq!(calls[0].tickers, vec![t("AAA")]);
        assert_eq!(calls[0].after, None);
        assert_eq!(calls[1].tickers, vec![t("BBB")]);
        assert_eq!(calls[1].after, Some(date(5)));

        assert_eq!(store.load(&t("AAA")).unwrap().len(), 3);
        let bbb = store.load(&t("BBB")).unwrap();
        assert_eq!(bbb.len(), 3);
        assert_eq!(bbb[2].close, 22.0);
        // Stored rows before the boundary are untouched.
        assert_eq!(bbb[0].close, 1.0);
    }
}

#[test]
fn shared_boundary_shares_a_call() {
    for (store, _dir) in backends() {
        for s in ["QQQ", "SQQQ", "TQQQ"] {
            store.merge(&t(s), &[clean(5)]).unwrap();
        }
        let source = RecordingSource::new([
            ("QQQ", vec![bar(6, 1.0), bar(7, 2.0)]),
            ("SQQQ", vec![bar(6, 3.0), bar(7, 4.0)]),
            ("TQQQ", vec![bar(6, 5.0), bar(7, 6.0)]),
        ]);
        let calendar = NyseCalendar::new();
        let report = SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("TQQQ"), t("QQQ"), t("SQQQ")], thursday_evening())
            .unwrap();

        let calls = source.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tickers, vec![t("QQQ"), t("SQQQ"), t("TQQQ")]);
        assert_eq!(report.rows_written(), 6);
    }
}

#[test]
fn up_to_date_batches_are_never_fetched() {
    for (store, _dir) in backends() {
        // Through the end session.
        store.merge(&t("AAA"), &[clean(7)]).unwrap();
        // A partial row for today, not yet a completed session.
        store.merge(&t("BBB"), &[clean(8)]).unwrap();

        let source = RecordingSource::new([("AAA", vec![bar(7, 1.0)]), ("BBB", vec![bar(8, 1.0)])]);
        let calendar = NyseCalendar::new();
        let report = SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("AAA"), t("BBB")], friday_morning())
            .unwrap();

        assert!(source.calls().is_empty());
        assert_eq!(report.batches_fetched, 0);
        assert_eq!(report.batches_skipped, 2);
        assert_eq!(report.up_to_date, vec![t("AAA"), t("BBB")]);
    }
}

#[test]
fn end_is_last_completed_session_before_close() {
    for (store, _dir) in backends() {
        let source = RecordingSource::new([("AAA", vec![bar(6, 1.0), bar(7, 2.0), bar(8, 3.0)])]);
        let calendar = NyseCalendar::new();
        SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("AAA")], friday_morning())
            .unwrap();

        let calls = source.calls();
        assert_eq!(calls[0].end.session_date, date(7));
        assert_eq!(calls[0].end.close, Utc.with_ymd_and_hms(2024, 3, 7, 21, 0, 0).unwrap());
        let rows = store.load(&t("AAA")).unwrap();
        assert_eq!(rows.last().unwrap().date, date(7));
    }
}

#[test]
fn padded_and_duplicated_rows_are_cleaned() {
    for (store, _dir) in backends() {
        let padding = SourceBar {
            date: date(5),
            adj_close: Some(1.0),
            ..Default::default()
        };
        let source = RecordingSource::new([(
            "AAA",
            vec![bar(4, 10.0), padding, bar(6, 12.0), bar(6, 12.5)],
        )]);
        let calendar = NyseCalendar::new();
        SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("AAA")], thursday_evening())
            .unwrap();

        let rows = store.load(&t("AAA")).unwrap();
        let dates: Vec<NaiveDate> = rows.iter().map(|r| r.date).collect();
        assert_eq!(dates, vec![date(4), date(6)]);
        assert_eq!(rows[1].close, 12.5);
    }
}

#[test]
fn failed_batch_keeps_earlier_batches() {
    for (store, _dir) in backends() {
        store.merge(&t("BBB"), &[clean(4)]).unwrap();
        let mut source = RecordingSource::new([
            ("AAA", vec![bar(4, 10.0), bar(5, 11.0)]),
            ("BBB", vec![bar(5, 20.0)]),
        ]);
        source.fail_incremental = true;
        let calendar = NyseCalendar::new();

        let err = SyncEngine::new(&store, &source, &calendar)
            .run_at(&[t("AAA"), t("BBB")], thursday_evening())
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch { ref tickers, .. } if tickers == &vec![t("BBB")]));

        assert_eq!(store.load(&t("AAA")).unwrap().len(), 2);
        assert_eq!(store.load(&t("BBB")).unwrap().len(), 1);
    }
}

#[test]
fn parallel_run_matches_sequential() {
    let mut loaded = Vec::new();
    for parallel in [false, true] {
        let store = StoreBackend::Sqlite(SqliteStore::open_in_memory().unwrap());
        store.merge(&t("BBB"), &[clean(4)]).unwrap();
        store.merge(&t("CCC"), &[clean(5)]).unwrap();
        let source = RecordingSource::new([
            ("AAA", vec![bar(4, 1.0), bar(5, 2.0), bar(6, 3.0)]),
            ("BBB", vec![bar(5, 4.0), bar(6, 5.0)]),
            ("CCC", vec![bar(6, 6.0)]),
        ]);
        let calendar = NyseCalendar::new();
        let report = SyncEngine::new(&store, &source, &calendar)
            .with_options(SyncOptions { parallel })
            .run_at(&[t("AAA"), t("BBB"), t("CCC")], thursday_evening())
            .unwrap();
        assert_eq!(source.calls().len(), 3);
        assert_eq!(report.rows_written(), 6);

        let all: Vec<_> = ["AAA", "BBB", "CCC"]
            .into_iter()
            .map(|s| store.load(&t(s)).unwrap())
            .collect();
        loaded.push(all);
    }
    assert_eq!(loaded[0], loaded[1]);
}

#[test]
fn empty_universe_does_nothing() {
    for (store, _dir) in backends() {
        let source = RecordingSource::new(Vec::<(&str, Vec<SourceBar>)>::new());
        let calendar = NyseCalendar::new();
        let report = SyncEngine::new(&store, &source, &calendar)
            .run_at(&[], thursday_evening())
            .unwrap();
        assert!(source.calls().is_empty());
        assert_eq!(report.batches_fetched + report.batches_skipped, 0);
    }
}

fn clean(d: u32) -> stocksync_core::PriceRow {
    stocksync_core::PriceRow {
        date: date(d),
        open: 1.0,
        high: 1.0,
        low: 1.0,
        close: 1.0,
        volume: 1,
    }
}
