mod analysis;
mod config;
mod error;
mod fanout;
mod output;
mod pipeline;
mod sources;
mod store;
mod types;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::sources::alpha_vantage::AlphaVantage;
use crate::store::RateStore;
use crate::types::CurrencyPair;

#[derive(Parser, Debug)]
#[command(
    name = "fx-rates",
    about = "Ingest daily FX closing rates into SQLite and report change vs the prior session"
)]
struct Args {
    /// Path to config YAML file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the rates table if it does not exist
    InitDb,

    /// Fetch all configured pairs, merge them into the store and report changes
    Run {
        /// Output format: "table" (default) or "json"
        #[arg(short, long, default_value = "table")]
        output: String,

        /// Override fetch.max_workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Only fetch these configured pairs (BASE/QUOTE, repeatable)
        #[arg(short, long = "pair")]
        pairs: Vec<CurrencyPair>,

        /// Merge only; do not run the change report
        #[arg(long)]
        skip_analysis: bool,
    },

    /// List the stored rates for one pair, oldest first
    History {
        /// Pair to list, e.g. USD/EUR
        pair: CurrencyPair,
    },

    /// Report changes from the rates already stored
    Analyze {
        /// Output format: "table" (default) or "json"
        #[arg(short, long, default_value = "table")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let cfg = config::Config::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    info!(
        "Loaded {} currency pair(s) from config; store {} table `{}`",
        cfg.pairs.len(),
        cfg.store.path.display(),
        cfg.store.table
    );

    match args.command {
        Command::InitDb => {
            let store = RateStore::open_or_create(&cfg.store.path, &cfg.store.table, cfg.store.batch_size)?;
            store.create_table()?;
            Ok(())
        }
        Command::History { pair } => {
            let store = RateStore::open(&cfg.store.path, &cfg.store.table, cfg.store.batch_size)?;
            store.ensure_ready()?;
            let rows = store
                .load_pair(&pair)
                .with_context(|| format!("reading stored rates for {}", pair))?;
            output::print_history(&pair, &rows);
            Ok(())
        }
        Command::Analyze { output } => {
            let store = RateStore::open(&cfg.store.path, &cfg.store.table, cfg.store.batch_size)?;
            store.ensure_ready()?;
            let analyzer = cfg.analysis.analyzer()?;
            let rows = analyzer
                .analyze(&store, chrono::Utc::now())
                .context("analyzing stored rates")?;
            render(&output, &rows, &[])
        }
        Command::Run {
            output,
            workers,
            pairs,
            skip_analysis,
        } => {
            let started = Instant::now();

            // Open before anything else so a dead store costs no API calls.
            let mut store = RateStore::open(&cfg.store.path, &cfg.store.table, cfg.store.batch_size)?;
            store.ensure_ready()?;

            let selected = select_pairs(cfg.currency_pairs(), &pairs)?;
            let max_workers = workers.unwrap_or(cfg.fetch.max_workers).max(1);
            let analyzer = if skip_analysis {
                None
            } else {
                Some(cfg.analysis.analyzer()?)
            };

            let api_key = std::env::var("ALPHA_VANTAGE_API_KEY")
                .context("ALPHA_VANTAGE_API_KEY not set")?;
            let client = reqwest::Client::builder()
                .user_agent("fx-rates/0.1")
                .timeout(Duration::from_secs(cfg.source.timeout_secs))
                .build()
                .context("building HTTP client")?;
            let source = Arc::new(AlphaVantage::new(client, api_key, cfg.source.base_url.clone()));

            let report = tokio::select! {
                report = pipeline::run(
                    source,
                    &mut store,
                    &selected,
                    max_workers,
                    analyzer.as_ref(),
                    chrono::Utc::now(),
                ) => report?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; abandoning in-flight fetches");
                    anyhow::bail!("interrupted");
                }
            };

            info!(
                "{}/{} pair(s) fetched, {} observation(s), {} merge failure(s)",
                report.pairs_requested - report.fetch_failures.len(),
                report.pairs_requested,
                report.observations,
                report.merge.failures.len()
            );
            match store.row_count() {
                Ok(n) => info!("Table `{}` now holds {} row(s)", store.table(), n),
                Err(e) => warn!("could not count rows in `{}`: {}", store.table(), e),
            }

            if let Some(rows) = &report.changes {
                render(&output, rows, &report.fetch_failures)?;
            } else {
                output::print_failures(&report.fetch_failures);
            }

            info!("Run finished in {:.2} seconds", started.elapsed().as_secs_f64());
            Ok(())
        }
    }
}

fn render(format: &str, rows: &[types::ChangeRow], failures: &[error::FetchError]) -> Result<()> {
    match format {
        "json" => output::print_json(rows, failures),
        _ => {
            output::print_table(rows);
            output::print_failures(failures);
            Ok(())
        }
    }
}

fn select_pairs(configured: Vec<CurrencyPair>, wanted: &[CurrencyPair]) -> Result<Vec<CurrencyPair>> {
    if wanted.is_empty() {
        return Ok(configured);
    }
    for w in wanted {
        if !configured.contains(w) {
            warn!("pair {} is not in the config; ignored", w);
        }
    }
    let selected: Vec<_> = configured.into_iter().filter(|p| wanted.contains(p)).collect();
    if selected.is_empty() {
        anyhow::bail!("none of the requested pairs are configured");
    }
    Ok(selected)
}
