//! stocksync core: incremental daily price sync.
//!
//! This crate contains:
//! - Domain types (tickers, stored price rows)
//! - NYSE market calendar and session boundaries
//! - Price stores (SQLite table, per-ticker Parquet documents) behind one trait
//! - Remote price source (Yahoo chart API) with retry and circuit breaker
//! - Ticker universes (fixed lists, Nasdaq Trader symbol directory)
//! - Gap planner, batch orchestrator and sync engine

pub mod calendar;
pub mod config;
pub mod domain;
pub mod source;
pub mod store;
pub mod sync;
pub mod universe;

pub use calendar::{MarketCalendar, NyseCalendar, SessionBoundary};
pub use config::SyncConfig;
pub use domain::{PriceRow, Ticker};
pub use source::{PriceSource, YahooSource};
pub use store::{PriceReader, PriceStore, StoreBackend};
pub use sync::{SyncEngine, SyncError, SyncReport};
pub use universe::UniverseProvider;
