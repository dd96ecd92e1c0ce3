//! Relational table store on SQLite.
//!
//! Schema: one table (default `prices`) with
//! `{ticker, date, open, high, low, close, volume}` and a primary key on
//! `(ticker, date)`. The key is what makes re-running a sync safe: merges are
//! `INSERT … ON CONFLICT DO UPDATE`, so a row for an already stored session
//! replaces the old values instead of appending a duplicate.
//!
//! Missing prices (`NaN`) are stored as SQL `NULL`.

use super::{dedup_by_date, MergeOutcome, PriceStore, StoreError, TickerSummary};
use crate::domain::{PriceRow, Ticker};
use chrono::NaiveDate;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const COLUMNS: usize = 7;

/// SQLite-backed price table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    table: String,
    chunk_rows: usize,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `":memory:"` opens a private
    /// in-memory database.
    pub fn open(path: &Path, table: &str, chunk_rows: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, table, chunk_rows)
    }

    /// In-memory store with default settings.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, "prices", 100)
    }

    fn with_connection(conn: Connection, table: &str, chunk_rows: usize) -> Result<Self, StoreError> {
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::Validation(format!(
                "table name '{table}' must be a plain identifier"
            )));
        }
        // SQLite caps bound parameters per statement; keep every chunk under
        // the conservative historical limit of 999.
        let max_chunk = 999 / COLUMNS;
        let chunk_rows = chunk_rows.clamp(1, max_chunk);

        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                ticker TEXT NOT NULL,
                date   TEXT NOT NULL,
                open   REAL,
                high   REAL,
                low    REAL,
                close  REAL,
                volume INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (ticker, date)
            ) WITHOUT ROWID;"
        ))?;

        Ok(Self {
            conn: Mutex::new(conn),
            table: table.to_string(),
            chunk_rows,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // The connection stays usable after a panic elsewhere; every merge
        // runs in its own transaction that rolls back on drop.
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn count_rows(conn: &Connection, table: &str, ticker: &Ticker) -> Result<usize, StoreError> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {table} WHERE ticker = ?1"),
            params![ticker.as_str()],
            |r| r.get(0),
        )?;
        Ok(n.max(0) as usize)
    }

    fn upsert_sql(&self, rows: usize) -> String {
        let table = &self.table;
        let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?)"; rows].join(", ");
        format!(
            "INSERT INTO {table} (ticker, date, open, high, low, close, volume)
             VALUES {placeholders}
             ON CONFLICT (ticker, date) DO UPDATE SET
                open = excluded.open,
                high = excluded.high,
                low = excluded.low,
                close = excluded.close,
                volume = excluded.volume
             WHERE {table}.open IS NOT excluded.open
                OR {table}.high IS NOT excluded.high
                OR {table}.low IS NOT excluded.low
                OR {table}.close IS NOT excluded.close
                OR {table}.volume IS NOT excluded.volume"
        )
    }
}

fn price_value(v: f64) -> Value {
    if v.is_nan() {
        Value::Null
    } else {
        Value::Real(v)
    }
}

fn row_values(ticker: &Ticker, row: &PriceRow) -> [Value; COLUMNS] {
    [
        Value::Text(ticker.as_str().to_string()),
        Value::Text(row.date.format("%Y-%m-%d").to_string()),
        price_value(row.open),
        price_value(row.high),
        price_value(row.low),
        price_value(row.close),
        Value::Integer(i64::try_from(row.volume).unwrap_or(i64::MAX)),
    ]
}

fn read_row(r: &Row<'_>) -> rusqlite::Result<PriceRow> {
    let price = |i: usize| -> rusqlite::Result<f64> {
        Ok(r.get::<_, Option<f64>>(i)?.unwrap_or(f64::NAN))
    };
    Ok(PriceRow {
        date: r.get(0)?,
        open: price(1)?,
        high: price(2)?,
        low: price(3)?,
        close: price(4)?,
        volume: r.get::<_, i64>(5)?.max(0) as u64,
    })
}

impl PriceStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn latest_date(&self, ticker: &Ticker) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.conn();
        let latest: Option<NaiveDate> = conn.query_row(
            &format!("SELECT MAX(date) FROM {} WHERE ticker = ?1", self.table),
            params![ticker.as_str()],
            |r| r.get(0),
        )?;
        Ok(latest)
    }

    fn merge(&self, ticker: &Ticker, rows: &[PriceRow]) -> Result<MergeOutcome, StoreError> {
        let rows = dedup_by_date(rows);
        if rows.is_empty() {
            return Ok(MergeOutcome::default());
        }

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let before = Self::count_rows(&tx, &self.table, ticker)?;
        let mut changed = 0usize;

        for chunk in rows.chunks(self.chunk_rows) {
            let values: Vec<Value> = chunk
                .iter()
                .flat_map(|row| row_values(ticker, row))
                .collect();
            changed += tx.execute(&self.upsert_sql(chunk.len()), params_from_iter(values))?;
        }

        let after = Self::count_rows(&tx, &self.table, ticker)?;
        tx.commit()?;

        let inserted = after.saturating_sub(before);
        let updated = changed.saturating_sub(inserted);
        let outcome = MergeOutcome {
            inserted,
            updated,
            unchanged: rows.len().saturating_sub(inserted + updated),
        };
        tracing::debug!(
            %ticker,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "merged rows into sqlite"
        );
        Ok(outcome)
    }

    fn load(&self, ticker: &Ticker) -> Result<Vec<PriceRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT date, open, high, low, close, volume FROM {}
             WHERE ticker = ?1 ORDER BY date ASC",
            self.table
        ))?;
        let rows = stmt
            .query_map(params![ticker.as_str()], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn tickers(&self) -> Result<Vec<Ticker>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT ticker FROM {} ORDER BY ticker",
            self.table
        ))?;
        let tickers = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .map(|t| t.map(Ticker::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tickers)
    }

    fn summary(&self, ticker: &Ticker) -> Result<Option<TickerSummary>, StoreError> {
        let conn = self.conn();
        let (first, last, rows): (Option<NaiveDate>, Option<NaiveDate>, i64) = conn.query_row(
            &format!(
                "SELECT MIN(date), MAX(date), COUNT(*) FROM {} WHERE ticker = ?1",
                self.table
            ),
            params![ticker.as_str()],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        Ok(match (first, last) {
            (Some(first_date), Some(last_date)) if rows > 0 => Some(TickerSummary {
                first_date,
                last_date,
                rows: rows as usize,
            }),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(day: u32, close: f64) -> PriceRow {
        PriceRow {
            date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000 + day as u64,
        }
    }

    #[test]
    fn empty_store_has_no_latest_date() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.latest_date(&Ticker::new("AAA")).unwrap(), None);
        assert!(store.load(&Ticker::new("AAA")).unwrap().is_empty());
        assert_eq!(store.summary(&Ticker::new("AAA")).unwrap(), None);
    }

    #[test]
    fn merge_then_latest_and_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        let aaa = Ticker::new("AAA");
        let outcome = store.merge(&aaa, &[row(4, 12.0), row(2, 10.0), row(3, 11.0)]).unwrap();
        assert_eq!(outcome.inserted, 3);

        assert_eq!(
            store.latest_date(&aaa).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 4)
        );
        let loaded = store.load(&aaa).unwrap();
        assert_eq!(loaded.iter().map(|r| r.close).collect::<Vec<_>>(), vec![10.0, 11.0, 12.0]);
    }

    #[test]
    fn merge_twice_does_not_duplicate() {
        let store = SqliteStore::open_in_memory().unwrap();
        let aaa = Ticker::new("AAA");
        let rows = vec![row(2, 10.0), row(3, 11.0)];

        store.merge(&aaa, &rows).unwrap();
        let first = store.load(&aaa).unwrap();
        let second_outcome = store.merge(&aaa, &rows).unwrap();

        assert_eq!(second_outcome.written(), 0);
        assert_eq!(second_outcome.unchanged, 2);
        assert_eq!(store.load(&aaa).unwrap(), first);
    }

    #[test]
    fn overlapping_merge_updates_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        let aaa = Ticker::new("AAA");
        store.merge(&aaa, &[row(2, 10.0), row(3, 11.0)]).unwrap();
        let outcome = store.merge(&aaa, &[row(3, 11.5), row(4, 12.0)]).unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(outcome.updated, 1);
        let loaded = store.load(&aaa).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[1].close, 11.5);
    }

    #[test]
    fn chunked_merge_covers_every_row() {
        let store = SqliteStore::with_connection(Connection::open_in_memory().unwrap(), "prices", 2)
            .unwrap();
        let aaa = Ticker::new("AAA");
        let rows: Vec<PriceRow> = (2..=9).map(|d| row(d, d as f64)).collect();
        let outcome = store.merge(&aaa, &rows).unwrap();
        assert_eq!(outcome.inserted, 8);
        assert_eq!(store.summary(&aaa).unwrap().unwrap().rows, 8);
    }

    #[test]
    fn missing_prices_roundtrip_as_nan() {
        let store = SqliteStore::open_in_memory().unwrap();
        let aaa = Ticker::new("AAA");
        let mut partial = row(2, 10.0);
        partial.open = f64::NAN;

        store.merge(&aaa, &[partial.clone()]).unwrap();
        let loaded = store.load(&aaa).unwrap();
        assert!(loaded[0].open.is_nan());
        assert!(loaded[0].same_values(&partial));

        let again = store.merge(&aaa, &[partial]).unwrap();
        assert_eq!(again.unchanged, 1);
    }

    #[test]
    fn tickers_are_isolated() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.merge(&Ticker::new("BBB"), &[row(2, 1.0)]).unwrap();
        store.merge(&Ticker::new("AAA"), &[row(2, 1.0), row(3, 2.0)]).unwrap();

        assert_eq!(
            store.tickers().unwrap(),
            vec![Ticker::new("AAA"), Ticker::new("BBB")]
        );
        assert_eq!(store.load(&Ticker::new("BBB")).unwrap().len(), 1);
    }

    #[test]
    fn rejects_bad_table_name() {
        let result = SqliteStore::with_connection(
            Connection::open_in_memory().unwrap(),
            "prices; DROP",
            10,
        );
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }
}
