use serde::{Deserialize, Serialize};
use std::fmt;

/// A stock or ETF symbol.
///
/// Opaque to the sync engine: it is only ever compared, ordered, used as a
/// storage key and handed to the remote source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Ticker(String);

impl Ticker {
    /// Build a ticker from user input: trims whitespace and upper-cases.
    pub fn new(symbol: &str) -> Self {
        Self(symbol.trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for Ticker {
    fn from(symbol: &str) -> Self {
        Self::new(symbol)
    }
}

impl From<String> for Ticker {
    fn from(symbol: String) -> Self {
        Self::new(&symbol)
    }
}

impl From<Ticker> for String {
    fn from(ticker: Ticker) -> Self {
        ticker.0
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
