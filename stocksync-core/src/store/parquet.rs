//! Per-ticker document store on Parquet with Hive-style partitioning.
//!
//! Layout: `{dir}/symbol={TICKER}/{year}.parquet` plus a `meta.json` sidecar.
//!
//! Each ticker's directory is its document: the full ordered history, split
//! into yearly partitions so an incremental merge rewrites only the years it
//! touches.
//!
//! - Atomic writes (write to .tmp, rename into place)
//! - Integrity validation on load (schema check, row count > 0)
//! - Quarantine for corrupt files ({filename}.quarantined)
//! - Metadata sidecar per ticker (date range, row count, content hash)
//!
//! Quarantining a partition drops the ticker's sidecar, and the sidecar is
//! only trusted while its last date is still present in the partition files.

use super::{dedup_by_date, MergeOutcome, PriceStore, StoreError, TickerSummary};
use crate::domain::{PriceRow, Ticker};
use chrono::{Datelike, NaiveDate};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

const SYMBOL_PREFIX: &str = "symbol=";
const META_FILE: &str = "meta.json";
const EXPECTED_COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Metadata sidecar for a stored ticker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerMeta {
    pub ticker: Ticker,
    pub first_date: NaiveDate,
    pub last_date: NaiveDate,
    pub row_count: usize,
    pub data_hash: String,
    pub updated_at: chrono::NaiveDateTime,
}

/// Parquet document store.
pub struct ParquetStore {
    dir: PathBuf,
}

impl ParquetStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Root directory of the store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ticker_dir(&self, ticker: &Ticker) -> PathBuf {
        self.dir.join(format!("{SYMBOL_PREFIX}{ticker}"))
    }

    fn year_path(&self, ticker: &Ticker, year: i32) -> PathBuf {
        self.ticker_dir(ticker).join(format!("{year}.parquet"))
    }

    fn meta_path(&self, ticker: &Ticker) -> PathBuf {
        self.ticker_dir(ticker).join(META_FILE)
    }

    /// Read the metadata sidecar, if present and readable.
    pub fn meta(&self, ticker: &Ticker) -> Option<TickerMeta> {
        let content = fs::read_to_string(self.meta_path(ticker)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Load one year partition. Missing partitions are empty; corrupt ones
    /// are quarantined and treated as empty.
    fn load_year(&self, ticker: &Ticker, year: i32) -> Vec<PriceRow> {
        let path = self.year_path(ticker, year);
        if !path.exists() {
            return Vec::new();
        }
        load_partition_or_quarantine(&path)
    }

    fn write_meta(&self, ticker: &Ticker) -> Result<(), StoreError> {
        let rows = self.load(ticker)?;
        let (Some(first), Some(last)) = (rows.first(), rows.last()) else {
            let _ = fs::remove_file(self.meta_path(ticker));
            return Ok(());
        };

        let hash_input = serde_json::to_vec(&rows)
            .map_err(|e| StoreError::Meta(format!("hash serialization: {e}")))?;
        let meta = TickerMeta {
            ticker: ticker.clone(),
            first_date: first.date,
            last_date: last.date,
            row_count: rows.len(),
            data_hash: blake3::hash(&hash_input).to_hex().to_string(),
            updated_at: chrono::Local::now().naive_local(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StoreError::Meta(format!("meta serialization: {e}")))?;

        let path = self.meta_path(ticker);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, meta_json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl PriceStore for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    fn latest_date(&self, ticker: &Ticker) -> Result<Option<NaiveDate>, StoreError> {
        if let Some(meta) = self.meta(ticker) {
            let last_in_partition = self
                .load_year(ticker, meta.last_date.year())
                .last()
                .map(|r| r.date);
            if last_in_partition == Some(meta.last_date) {
                return Ok(Some(meta.last_date));
            }
            tracing::warn!(%ticker, last_date = %meta.last_date, "stale metadata sidecar, rebuilding");
            self.write_meta(ticker)?;
        }
        Ok(self.load(ticker)?.last().map(|r| r.date))
    }

    fn merge(&self, ticker: &Ticker, rows: &[PriceRow]) -> Result<MergeOutcome, StoreError> {
        let rows = dedup_by_date(rows);
        if rows.is_empty() {
            return Ok(MergeOutcome::default());
        }

        fs::create_dir_all(self.ticker_dir(ticker))?;

        let mut by_year: BTreeMap<i32, Vec<PriceRow>> = BTreeMap::new();
        for row in rows {
            by_year.entry(row.date.year()).or_default().push(row);
        }

        let mut outcome = MergeOutcome::default();
        for (year, incoming) in by_year {
            let mut merged: BTreeMap<NaiveDate, PriceRow> = self
                .load_year(ticker, year)
                .into_iter()
                .map(|r| (r.date, r))
                .collect();

            let mut dirty = false;
            for row in incoming {
                match merged.get(&row.date) {
                    None => {
                        outcome.inserted += 1;
                        dirty = true;
                    }
                    Some(existing) if existing.same_values(&row) => {
                        outcome.unchanged += 1;
                        continue;
                    }
                    Some(_) => {
                        outcome.updated += 1;
                        dirty = true;
                    }
                }
                merged.insert(row.date, row);
            }

            if dirty {
                let partition: Vec<PriceRow> = merged.into_values().collect();
                write_partition_atomic(&self.year_path(ticker, year), &partition)?;
            }
        }

        if outcome.written() > 0 || self.meta(ticker).is_none() {
            self.write_meta(ticker)?;
        }

        tracing::debug!(
            %ticker,
            inserted = outcome.inserted,
            updated = outcome.updated,
            "merged rows into parquet"
        );
        Ok(outcome)
    }

    fn load(&self, ticker: &Ticker) -> Result<Vec<PriceRow>, StoreError> {
        let dir = self.ticker_dir(ticker);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut all_rows = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();

            // Skip non-parquet files (meta.json, .quarantined, .tmp)
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            all_rows.extend(load_partition_or_quarantine(&path));
        }

        Ok(dedup_by_date(&all_rows))
    }

    fn tickers(&self) -> Result<Vec<Ticker>, StoreError> {
        let mut tickers = BTreeSet::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(symbol) = name.to_str().and_then(|n| n.strip_prefix(SYMBOL_PREFIX)) else {
                continue;
            };
            let ticker = Ticker::new(symbol);
            if self.latest_date(&ticker)?.is_some() {
                tickers.insert(ticker);
            }
        }
        Ok(tickers.into_iter().collect())
    }

    fn summary(&self, ticker: &Ticker) -> Result<Option<TickerSummary>, StoreError> {
        // Validates (or rebuilds) the sidecar before it is read.
        if self.latest_date(ticker)?.is_none() {
            return Ok(None);
        }
        if let Some(meta) = self.meta(ticker) {
            return Ok(Some(TickerSummary {
                first_date: meta.first_date,
                last_date: meta.last_date,
                rows: meta.row_count,
            }));
        }
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

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn load_partition_or_quarantine(path: &Path) -> Vec<PriceRow> {
    match load_and_validate_parquet(path) {
        Ok(rows) => rows,
        Err(e) => {
            let quarantine = path.with_extension("parquet.quarantined");
            tracing::warn!(path = %path.display(), error = %e, "quarantining corrupt partition");
            let _ = fs::rename(path, &quarantine);
            // The sidecar still describes the quarantined rows.
            let _ = fs::remove_file(path.with_file_name(META_FILE));
            Vec::new()
        }
    }
}

/// Write a partition to `{path}.tmp` and rename it into place.
fn write_partition_atomic(path: &Path, rows: &[PriceRow]) -> Result<(), StoreError> {
    let mut df = rows_to_dataframe(rows)?;
    let tmp_path = path.with_extension("parquet.tmp");

    let file = fs::File::create(&tmp_path)?;
    ParquetWriter::new(file)
        .finish(&mut df)
        .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        StoreError::Parquet(format!("atomic rename failed: {e}"))
    })
}

fn rows_to_dataframe(rows: &[PriceRow]) -> Result<DataFrame, StoreError> {
    let dates: Vec<i32> = rows
        .iter()
        .map(|r| (r.date - epoch()).num_days() as i32)
        .collect();
    let opens: Vec<f64> = rows.iter().map(|r| r.open).collect();
    let highs: Vec<f64> = rows.iter().map(|r| r.high).collect();
    let lows: Vec<f64> = rows.iter().map(|r| r.low).collect();
    let closes: Vec<f64> = rows.iter().map(|r| r.close).collect();
    let volumes: Vec<u64> = rows.iter().map(|r| r.volume).collect();

    DataFrame::new(vec![
        Column::new("date".into(), dates)
            .cast(&DataType::Date)
            .map_err(|e| StoreError::Parquet(format!("date cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("close".into(), closes),
        Column::new("volume".into(), volumes),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

fn load_and_validate_parquet(path: &Path) -> Result<Vec<PriceRow>, StoreError> {
    let file = fs::File::open(path)?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| StoreError::Parquet(format!("read: {e}")))?;

    if df.height() == 0 {
        return Err(StoreError::Validation("empty parquet file".into()));
    }
    for col_name in EXPECTED_COLUMNS {
        if df.column(col_name).is_err() {
            return Err(StoreError::Validation(format!(
                "missing column '{col_name}'"
            )));
        }
    }

    dataframe_to_rows(&df)
}

fn dataframe_to_rows(df: &DataFrame) -> Result<Vec<PriceRow>, StoreError> {
    let map_err = |e: PolarsError| StoreError::Parquet(format!("column read: {e}"));
    let typed = |name: &str, e: PolarsError| StoreError::Parquet(format!("{name} column type: {e}"));

    let date_col = df.column("date").map_err(map_err)?;
    let open_col = df.column("open").map_err(map_err)?;
    let high_col = df.column("high").map_err(map_err)?;
    let low_col = df.column("low").map_err(map_err)?;
    let close_col = df.column("close").map_err(map_err)?;
    let volume_col = df.column("volume").map_err(map_err)?;

    let dates = date_col.date().map_err(|e| typed("date", e))?;
    let opens = open_col.f64().map_err(|e| typed("open", e))?;
    let highs = high_col.f64().map_err(|e| typed("high", e))?;
    let lows = low_col.f64().map_err(|e| typed("low", e))?;
    let closes = close_col.f64().map_err(|e| typed("close", e))?;
    let volumes = volume_col.u64().map_err(|e| typed("volume", e))?;

    let epoch = epoch();
    let mut rows = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let days = dates
            .get(i)
            .ok_or_else(|| StoreError::Parquet(format!("null date at row {i}")))?;
        rows.push(PriceRow {
            date: epoch + chrono::Duration::days(days as i64),
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0),
        });
    }

    Ok(rows)
}
