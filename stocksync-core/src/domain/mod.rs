//! Domain types: tickers and daily price rows.

pub mod row;
pub mod ticker;

pub use row::PriceRow;
pub use ticker::Ticker;
