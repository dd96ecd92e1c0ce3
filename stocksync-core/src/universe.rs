//! Ticker universes: which symbols a run syncs.
//!
//! `FixedUniverse` is a configured list, optionally loaded from a TOML file
//! of named groups. `SymbolDirectory` pulls the full list of listed common
//! stocks from the Nasdaq Trader symbol directory.

use crate::config::UniverseConfig;
use crate::domain::Ticker;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const NASDAQ_LISTED_URL: &str = "https://www.nasdaqtrader.com/dynamic/SymDir/nasdaqlisted.txt";
pub const OTHER_LISTED_URL: &str = "https://www.nasdaqtrader.com/dynamic/SymDir/otherlisted.txt";

const TRAILER_PREFIX: &str = "File Creation Time";
const NON_COMMON_SYMBOL_CHARS: [char; 5] = ['$', '+', '=', '^', '#'];
const NON_COMMON_NAME_WORDS: [&str; 7] = [
    "warrant",
    "warrants",
    "unit",
    "units",
    "right",
    "rights",
    "preferred",
];

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("read universe file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse universe TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("malformed {kind:?} listing: {reason}")]
    Listing { kind: ListingKind, reason: String },
}

/// Source of the ticker set for a run.
pub trait UniverseProvider: Send + Sync {
    fn name(&self) -> &str;

    fn list(&self) -> Result<BTreeSet<Ticker>, UniverseError>;
}

/// Build the provider described by `config`.
pub fn from_config(config: &UniverseConfig) -> Result<Box<dyn UniverseProvider>, UniverseError> {
    Ok(match config {
        UniverseConfig::Fixed { tickers } => Box::new(FixedUniverse::new(tickers.iter().cloned())),
        UniverseConfig::File { path } => Box::new(FixedUniverse::from_file(path)?),
        UniverseConfig::NasdaqDirectory {
            include_etfs,
            timeout_secs,
        } => Box::new(
            SymbolDirectory::new(*include_etfs).with_timeout(Duration::from_secs(*timeout_secs)),
        ),
    })
}

// ── Fixed list ──────────────────────────────────────────────────────

/// A configured ticker list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedUniverse {
    tickers: BTreeSet<Ticker>,
}

/// On-disk form: named groups of tickers.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupsFile {
    groups: BTreeMap<String, Vec<Ticker>>,
}

impl FixedUniverse {
    pub fn new(tickers: impl IntoIterator<Item = Ticker>) -> Self {
        Self {
            tickers: tickers.into_iter().filter(|t| !t.is_empty()).collect(),
        }
    }

    /// The three Nasdaq-100 ETFs synced when nothing else is configured.
    pub fn default_reference() -> Self {
        Self::new(["QQQ", "TQQQ", "SQQQ"].into_iter().map(Ticker::new))
    }

    /// Load every group from a TOML groups file.
    pub fn from_file(path: &Path) -> Result<Self, UniverseError> {
        let content = std::fs::read_to_string(path).map_err(|source| UniverseError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    /// Parse `[groups] name = ["T1", ...]`; all groups are merged.
    pub fn from_toml(content: &str) -> Result<Self, UniverseError> {
        let file: GroupsFile = toml::from_str(content)?;
        Ok(Self::new(file.groups.into_values().flatten()))
    }

    pub fn tickers(&self) -> &BTreeSet<Ticker> {
        &self.tickers
    }
}

impl Default for FixedUniverse {
    fn default() -> Self {
        Self::default_reference()
    }
}

impl UniverseProvider for FixedUniverse {
    fn name(&self) -> &str {
        "fixed"
    }

    fn list(&self) -> Result<BTreeSet<Ticker>, UniverseError> {
        Ok(self.tickers.clone())
    }
}

// ── Nasdaq Trader symbol directory ──────────────────────────────────

/// Which directory file a listing came from; the two use different headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingKind {
    /// `nasdaqlisted.txt`: Nasdaq-listed securities.
    NasdaqListed,
    /// `otherlisted.txt`: NYSE, NYSE American, Arca, Cboe and IEX listings.
    OtherListed,
}

impl ListingKind {
    fn symbol_column(self) -> &'static str {
        match self {
            ListingKind::NasdaqListed => "Symbol",
            ListingKind::OtherListed => "ACT Symbol",
        }
    }

    pub fn url(self) -> &'static str {
        match self {
            ListingKind::NasdaqListed => NASDAQ_LISTED_URL,
            ListingKind::OtherListed => OTHER_LISTED_URL,
        }
    }
}

/// One row of a directory listing after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub symbol: String,
    pub name: String,
    pub is_etf: bool,
    pub is_test_issue: bool,
}

impl Listing {
    /// Plain common stock (or ETF): not a test issue, preferred share,
    /// warrant, unit, or right.
    pub fn is_common(&self) -> bool {
        if self.is_test_issue || self.symbol.is_empty() {
            return false;
        }
        if self.symbol.contains(NON_COMMON_SYMBOL_CHARS) {
            return false;
        }
        !self
            .name
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| {
                let word = word.to_ascii_lowercase();
                NON_COMMON_NAME_WORDS.contains(&word.as_str())
            })
    }
}

/// Parse one `|`-delimited directory file. The trailing creation-time
/// line is discarded.
pub fn parse_listing(kind: ListingKind, text: &str) -> Result<Vec<Listing>, UniverseError> {
    let malformed = |reason: String| UniverseError::Listing { kind, reason };

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'|')
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| malformed(format!("header: {e}")))?
        .clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| malformed(format!("missing column '{name}'")))
    };
    let symbol_idx = column(kind.symbol_column())?;
    let name_idx = column("Security Name")?;
    let etf_idx = column("ETF")?;
    let test_idx = column("Test Issue")?;

    let mut listings = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| malformed(format!("record: {e}")))?;
        let symbol = record.get(symbol_idx).unwrap_or_default();
        if symbol.starts_with(TRAILER_PREFIX) {
            continue;
        }
        listings.push(Listing {
            symbol: symbol.to_string(),
            name: record.get(name_idx).unwrap_or_default().to_string(),
            is_etf: record.get(etf_idx) == Some("Y"),
            is_test_issue: record.get(test_idx) == Some("Y"),
        });
    }
    Ok(listings)
}

/// Every listed common stock in the Nasdaq Trader symbol directory.
pub struct SymbolDirectory {
    include_etfs: bool,
    timeout: Duration,
}

impl SymbolDirectory {
    pub fn new(include_etfs: bool) -> Self {
        Self {
            include_etfs,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// HTTP timeout for each directory download.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Tickers selected from already-parsed listings.
    pub fn select(&self, listings: &[Listing]) -> BTreeSet<Ticker> {
        listings
            .iter()
            .filter(|l| l.is_common())
            .filter(|l| self.include_etfs || !l.is_etf)
            .map(|l| Ticker::new(&l.symbol))
            .collect()
    }

    fn download(
        &self,
        client: &reqwest::blocking::Client,
        kind: ListingKind,
    ) -> Result<String, UniverseError> {
        let url = kind.url();
        let failed = |reason: String| UniverseError::Download {
            url: url.to_string(),
            reason,
        };
        let response = client.get(url).send().map_err(|e| failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        response.text().map_err(|e| failed(e.to_string()))
    }
}

impl UniverseProvider for SymbolDirectory {
    fn name(&self) -> &str {
        "nasdaq_directory"
    }

    fn list(&self) -> Result<BTreeSet<Ticker>, UniverseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| UniverseError::Download {
                url: NASDAQ_LISTED_URL.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let mut tickers = BTreeSet::new();
        for kind in [ListingKind::NasdaqListed, ListingKind::OtherListed] {
            let text = self.download(&client, kind)?;
            let listings = parse_listing(kind, &text)?;
            let selected = self.select(&listings);
            tracing::info!(
                listing = ?kind,
                rows = listings.len(),
                selected = selected.len(),
                "parsed symbol directory"
            );
            tickers.extend(selected);
        }
        Ok(tickers)
    }
}
