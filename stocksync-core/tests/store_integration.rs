//! Store contract tests run against both backends, plus persistence across
//! reopen.

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use stocksync_core::config::StoreConfig;
use stocksync_core::store::{ParquetStore, PriceReader, PriceStore, SqliteStore, StoreBackend};
use stocksync_core::{PriceRow, Ticker};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(label: &str) -> PathBuf {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!(
        "stocksync_store_{label}_{}_{id}",
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&path);
    let _ = std::fs::remove_file(&path);
    path
}

fn row(offset: i64, close: f64) -> PriceRow {
    PriceRow {
        date: NaiveDate::from_ymd_opt(2023, 12, 20).unwrap() + Duration::days(offset),
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100 + offset as u64,
    }
}

fn assert_ascending_unique(rows: &[PriceRow]) {
    for pair in rows.windows(2) {
        assert!(pair[0].date < pair[1].date, "{} !< {}", pair[0].date, pair[1].date);
    }
}

fn check_contract(store: &dyn PriceStore) {
    let spy = Ticker::new("SPY");
    // Spans a year boundary so the parquet store touches two partitions.
    let rows: Vec<PriceRow> = (0..20).map(|i| row(i, 400.0 + i as f64)).collect();

    let first = store.merge(&spy, &rows).unwrap();
    assert_eq!(first.inserted, 20, "{}", store.name());
    let once = store.load(&spy).unwrap();

    let second = store.merge(&spy, &rows).unwrap();
    assert_eq!(second.written(), 0, "{}", store.name());
    let twice = store.load(&spy).unwrap();
    assert_eq!(once, twice);
    assert_ascending_unique(&twice);

    // Overlapping merge with one revised value and one new date.
    let revised = vec![row(19, 999.0), row(20, 420.0)];
    let outcome = store.merge(&spy, &revised).unwrap();
    assert_eq!((outcome.inserted, outcome.updated), (1, 1));
    let rows = store.load(&spy).unwrap();
    assert_eq!(rows.len(), 21);
    assert_eq!(rows[19].close, 999.0);
    assert_ascending_unique(&rows);

    let summary = store.summary(&spy).unwrap().unwrap();
    assert_eq!(summary.rows, 21);
    assert_eq!(summary.first_date, row(0, 0.0).date);
    assert_eq!(store.latest_date(&spy).unwrap(), Some(row(20, 0.0).date));
    assert_eq!(store.tickers().unwrap(), vec![spy]);
}

#[test]
fn sqlite_honours_store_contract() {
    let store = SqliteStore::open_in_memory().unwrap();
    check_contract(&store);
}

#[test]
fn parquet_honours_store_contract() {
    let dir = temp_path("parquet");
    let store = ParquetStore::open(&dir).unwrap();
    check_contract(&store);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn sqlite_file_persists_across_reopen() {
    let path = temp_path("sqlite").with_extension("sqlite");
    let config = StoreConfig::Sqlite {
        path: path.clone(),
        table: "prices".into(),
        chunk_rows: 3,
    };
    let qqq = Ticker::new("QQQ");
    {
        let store = StoreBackend::open(&config).unwrap();
        store
            .merge(&qqq, &(0..10).map(|i| row(i, 1.0)).collect::<Vec<_>>())
            .unwrap();
    }

    let store = StoreBackend::open(&config).unwrap();
    assert_eq!(store.load(&qqq).unwrap().len(), 10);
    let _ = std::fs::remove_file(&path);
}

#[test]
fn parquet_persists_across_reopen() {
    let dir = temp_path("parquet_reopen");
    let config = StoreConfig::Parquet { dir: dir.clone() };
    let qqq = Ticker::new("QQQ");
    {
        let store = StoreBackend::open(&config).unwrap();
        store.merge(&qqq, &[row(0, 1.0), row(15, 2.0)]).unwrap();
    }

    let store = StoreBackend::open(&config).unwrap();
    assert_eq!(store.name(), "parquet");
    let reader = PriceReader::new(&store);
    let status = reader.status_all().unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].rows, 2);
    assert_eq!(status[0].last_date, Some(row(15, 0.0).date));
    let _ = std::fs::remove_dir_all(&dir);
}

/// Merge every batch in order, then check the store holds one row per date,
/// ascending, with the last value merged for that date.
fn check_merges(
    store: &dyn PriceStore,
    merges: &[Vec<(i64, f64)>],
) -> Result<(), TestCaseError> {
    let ticker = Ticker::new("AAA");
    let mut expected: BTreeMap<NaiveDate, f64> = BTreeMap::new();

    for batch in merges {
        let rows: Vec<PriceRow> = batch.iter().map(|&(d, c)| row(d, c)).collect();
        store.merge(&ticker, &rows).unwrap();
        for r in &rows {
            expected.insert(r.date, r.close);
        }
    }

    let loaded = store.load(&ticker).unwrap();
    let got: BTreeMap<NaiveDate, f64> = loaded.iter().map(|r| (r.date, r.close)).collect();
    prop_assert_eq!(loaded.len(), got.len());
    prop_assert_eq!(got, expected.clone());
    for pair in loaded.windows(2) {
        prop_assert!(pair[0].date < pair[1].date);
    }
    prop_assert_eq!(store.latest_date(&ticker).unwrap(), expected.keys().next_back().copied());
    Ok(())
}

fn arb_merges() -> impl Strategy<Value = Vec<Vec<(i64, f64)>>> {
    // Offsets 0..30 from 2023-12-20 straddle the year boundary.
    prop::collection::vec(prop::collection::vec((0i64..30, 1.0..100.0_f64), 0..15), 1..6)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sqlite_merges_keep_one_row_per_date(merges in arb_merges()) {
        let store = SqliteStore::open_in_memory().unwrap();
        check_merges(&store, &merges)?;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn parquet_merges_keep_one_row_per_date(merges in arb_merges()) {
        let dir = temp_path("parquet_prop");
        let store = ParquetStore::open(&dir).unwrap();
        let result = check_merges(&store, &merges);
        let _ = std::fs::remove_dir_all(&dir);
        result?;
    }
}
