//! PriceRow: one trading day for one ticker.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Daily OHLCV row in its canonical, stored shape.
///
/// A price component the source did not report is stored as `NaN`.
/// Stores hold at most one row per (ticker, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRow {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl PriceRow {
    /// True when every price component is present.
    pub fn is_complete(&self) -> bool {
        !(self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan())
    }

    /// Equality that treats two `NaN` components as equal.
    ///
    /// Derived `PartialEq` never matches a row with a missing price, which
    /// would make upserts of partial rows look like updates on every merge.
    pub fn same_values(&self, other: &PriceRow) -> bool {
        fn eq(a: f64, b: f64) -> bool {
            a == b || (a.is_nan() && b.is_nan())
        }
        self.date == other.date
            && eq(self.open, other.open)
            && eq(self.high, other.high)
            && eq(self.low, other.low)
            && eq(self.close, other.close)
            && self.volume == other.volume
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(close: f64) -> PriceRow {
        PriceRow {
            date: NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn nan_components_compare_equal() {
        let a = row(f64::NAN);
        let b = row(f64::NAN);
        assert_ne!(a, b);
        assert!(a.same_values(&b));
        assert!(!a.same_values(&row(101.0)));
    }

    #[test]
    fn completeness() {
        assert!(row(101.0).is_complete());
        assert!(!row(f64::NAN).is_complete());
    }
}
