//! stocksync CLI: incremental daily price sync and store inspection.
//!
//! Commands:
//! - `sync` (default): bring every ticker up to the last completed session
//! - `load`: print a ticker's stored history
//! - `status`: report stored date ranges and row counts
//! - `universe`: list the tickers a sync would cover
//! - `config init`: write the default configuration file

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stocksync_core::config::{StoreConfig, SyncConfig, UniverseConfig};
use stocksync_core::source::{CircuitBreaker, YahooSource};
use stocksync_core::store::{PriceReader, PriceStore, StoreBackend};
use stocksync_core::sync::{LogProgress, SyncEngine, SyncPlan, SyncReport};
use stocksync_core::universe::{self, UniverseProvider};
use stocksync_core::{NyseCalendar, PriceRow, Ticker};

#[derive(Parser)]
#[command(
    name = "stocksync",
    version,
    about = "Incremental daily stock price sync into SQLite or Parquet"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// TOML config file. Defaults to built-in settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store backend, overriding the config file.
    #[arg(long, global = true, value_enum)]
    store: Option<StoreKind>,

    /// SQLite file or Parquet directory, overriding the config file.
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// More logging (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Sqlite,
    Parquet,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch every missing completed session and merge it into the store.
    Sync {
        /// Tickers to sync (e.g., QQQ TQQQ). Defaults to the configured universe.
        tickers: Vec<String>,

        /// Sync every common stock in the Nasdaq Trader symbol directory.
        #[arg(long, default_value_t = false, conflicts_with = "tickers")]
        nasdaq: bool,

        /// Print the plan without fetching.
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Run independent batches concurrently.
        #[arg(long, default_value_t = false)]
        parallel: bool,
    },
    /// Print the stored history of one ticker.
    Load {
        ticker: String,

        /// First date to include (YYYY-MM-DD).
        #[arg(long)]
        start: Option<String>,

        /// Last date to include (YYYY-MM-DD).
        #[arg(long)]
        end: Option<String>,

        /// Only the most recent N rows.
        #[arg(long)]
        tail: Option<usize>,

        /// Emit JSON instead of a table.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report stored date ranges. Defaults to every stored ticker.
    Status { tickers: Vec<String> },
    /// List the tickers a sync would cover.
    Universe {
        /// Use the Nasdaq Trader symbol directory.
        #[arg(long, default_value_t = false)]
        nasdaq: bool,
    },
    /// Configuration file commands.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration as TOML.
    Init {
        #[arg(long, default_value = "stocksync.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long, default_value_t = false)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let default_command = Commands::Sync {
        tickers: Vec::new(),
        nasdaq: false,
        dry_run: false,
        parallel: false,
    };
    let command = cli.command.as_ref().unwrap_or(&default_command);

    if let Commands::Config {
        action: ConfigAction::Init { path, force },
    } = command
    {
        return run_config_init(path, *force);
    }

    let config = resolve_config(&cli)?;
    match command {
        Commands::Sync {
            tickers,
            nasdaq,
            dry_run,
            parallel,
        } => run_sync(config, tickers, *nasdaq, *dry_run, *parallel),
        Commands::Load {
            ticker,
            start,
            end,
            tail,
            json,
        } => run_load(&config, ticker, start.as_deref(), end.as_deref(), *tail, *json),
        Commands::Status { tickers } => run_status(&config, tickers),
        Commands::Universe { nasdaq } => run_universe(&config, *nasdaq),
        Commands::Config { .. } => Ok(()),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Config file (or defaults) with `--store` / `--path` applied.
fn resolve_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };

    config.store = match (cli.store, config.store) {
        (Some(StoreKind::Sqlite), store @ StoreConfig::Sqlite { .. })
        | (Some(StoreKind::Parquet), store @ StoreConfig::Parquet { .. })
        | (None, store) => store,
        (Some(StoreKind::Sqlite), StoreConfig::Parquet { .. }) => StoreConfig::default(),
        (Some(StoreKind::Parquet), StoreConfig::Sqlite { .. }) => StoreConfig::parquet("data"),
    };
    if let Some(path) = &cli.path {
        config.store = config.store.with_location(path.clone());
    }

    config.validate()?;
    Ok(config)
}

fn parse_tickers(raw: &[String]) -> Vec<Ticker> {
    raw.iter()
        .map(|s| Ticker::new(s))
        .filter(|t| !t.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn universe_tickers(config: &SyncConfig, nasdaq: bool) -> Result<Vec<Ticker>> {
    let universe_config = if nasdaq {
        UniverseConfig::NasdaqDirectory {
            include_etfs: true,
            timeout_secs: config.source.timeout_secs,
        }
    } else {
        config.universe.clone()
    };
    let provider = universe::from_config(&universe_config)?;
    let tickers = provider.list()?;
    tracing::info!(universe = provider.name(), tickers = tickers.len(), "universe resolved");
    Ok(tickers.into_iter().collect())
}

fn run_sync(
    mut config: SyncConfig,
    tickers: &[String],
    nasdaq: bool,
    dry_run: bool,
    parallel: bool,
) -> Result<()> {
    config.sync.parallel |= parallel;

    let tickers = if tickers.is_empty() {
        universe_tickers(&config, nasdaq)?
    } else {
        parse_tickers(tickers)
    };

    let store = StoreBackend::open(&config.store)?;
    let circuit_breaker = Arc::new(CircuitBreaker::from_config(&config.source));
    let source = YahooSource::new(circuit_breaker, &config.source)?;
    let calendar = NyseCalendar::new();
    let progress = LogProgress;
    let engine = SyncEngine::new(&store, &source, &calendar)
        .with_options(config.sync.clone())
        .with_progress(&progress);

    if dry_run {
        let plan = engine.plan_at(&tickers, Utc::now())?;
        print_plan(&plan);
        return Ok(());
    }

    let report = engine.run(&tickers)?;
    print_report(&report);
    Ok(())
}

fn run_load(
    config: &SyncConfig,
    ticker: &str,
    start: Option<&str>,
    end: Option<&str>,
    tail: Option<usize>,
    json: bool,
) -> Result<()> {
    let ticker = Ticker::new(ticker);
    if ticker.is_empty() {
        bail!("ticker must not be empty");
    }
    let start = start.map(parse_date).transpose()?;
    let end = end.map(parse_date).transpose()?;

    let store = StoreBackend::open(&config.store)?;
    let reader = PriceReader::new(&store);
    let rows = match tail {
        Some(n) => reader.tail_range(&ticker, start, end, n)?,
        None => reader.load_range(&ticker, start, end)?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }
    if rows.is_empty() {
        println!("No stored rows for {ticker} in {}", store.name());
        return Ok(());
    }
    print_rows(&rows);
    Ok(())
}

fn run_status(config: &SyncConfig, tickers: &[String]) -> Result<()> {
    let store = StoreBackend::open(&config.store)?;
    let reader = PriceReader::new(&store);
    let statuses = if tickers.is_empty() {
        reader.status_all()?
    } else {
        reader.status(&parse_tickers(tickers))?
    };

    println!("Store: {} ({})", store.name(), config.store.location().display());
    if statuses.is_empty() {
        println!("Store is empty.");
        return Ok(());
    }

    println!("Tickers: {}", statuses.iter().filter(|s| s.stored).count());
    println!();
    println!("{:<8} {:<25} {:>8}", "Ticker", "Date Range", "Rows");
    println!("{}", "-".repeat(43));
    for status in &statuses {
        let range = match (status.first_date, status.last_date) {
            (Some(first), Some(last)) => format!("{first} to {last}"),
            _ => "(no data)".to_string(),
        };
        println!("{:<8} {:<25} {:>8}", status.ticker, range, status.rows);
    }
    Ok(())
}

fn run_universe(config: &SyncConfig, nasdaq: bool) -> Result<()> {
    let tickers = universe_tickers(config, nasdaq)?;
    for ticker in &tickers {
        println!("{ticker}");
    }
    eprintln!("{} ticker(s)", tickers.len());
    Ok(())
}

fn run_config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (pass --force to overwrite)", path.display());
    }
    let text = SyncConfig::default().to_toml()?;
    std::fs::write(path, text).with_context(|| format!("write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn format_price(v: f64) -> String {
    if v.is_nan() {
        "-".to_string()
    } else {
        format!("{v:.4}")
    }
}

fn print_rows(rows: &[PriceRow]) {
    println!(
        "{:<10} {:>12} {:>12} {:>12} {:>12} {:>14}",
        "Date", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{}", "-".repeat(77));
    for row in rows {
        println!(
            "{:<10} {:>12} {:>12} {:>12} {:>12} {:>14}",
            row.date,
            format_price(row.open),
            format_price(row.high),
            format_price(row.low),
            format_price(row.close),
            row.volume
        );
    }
}

fn print_plan(plan: &SyncPlan) {
    println!();
    println!("=== Sync Plan ===");
    println!("End session:    {} (close {})", plan.end.session_date, plan.end.close);
    println!("Today:          {}", plan.today);
    println!("Tickers:        {}", plan.ticker_count());
    println!();
    for batch in &plan.batches {
        let start = batch
            .start
            .map_or_else(|| "full history".to_string(), |d| format!("after {d}"));
        println!("FETCH  {:<16} {}", start, join_tickers(&batch.tickers));
    }
    for batch in &plan.skipped {
        let start = batch.start.map_or_else(String::new, |d| format!("through {d}"));
        println!("SKIP   {:<16} {}", start, join_tickers(&batch.tickers));
    }
    println!();
}

fn print_report(report: &SyncReport) {
    println!();
    println!("=== Sync Result ===");
    println!("End session:    {}", report.end.session_date);
    println!(
        "Batches:        {} fetched, {} up to date",
        report.batches_fetched, report.batches_skipped
    );
    println!("Remote calls:   {}", report.remote_calls);
    println!("Rows written:   {}", report.rows_written());
    for (ticker, outcome) in &report.merged {
        println!(
            "  {ticker:<8} +{} new, {} revised",
            outcome.inserted, outcome.updated
        );
    }
    if !report.empty.is_empty() {
        println!("No new data:    {}", join_tickers(&report.empty));
    }
    println!();
}

fn join_tickers(tickers: &[Ticker]) -> String {
    const MAX_SHOWN: usize = 12;
    let shown: Vec<&str> = tickers.iter().take(MAX_SHOWN).map(Ticker::as_str).collect();
    let mut text = shown.join(" ");
    if tickers.len() > MAX_SHOWN {
        text.push_str(&format!(" (+{} more)", tickers.len() - MAX_SHOWN));
    }
    text
}
