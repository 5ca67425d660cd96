use crate::analysis::ChangeAnalyzer;
use crate::error::FetchError;
use crate::fanout;
use crate::sources::QuoteSource;
use crate::store::{MergeReport, RateStore};
use crate::types::{ChangeRow, CurrencyPair};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug)]
pub struct RunReport {
    pub pairs_requested: usize,
    pub observations: usize,
    pub fetch_failures: Vec<FetchError>,
    pub merge: MergeReport,
    /// `None` when analysis was skipped.
    pub changes: Option<Vec<ChangeRow>>,
}

/// Fetch, merge and (optionally) analyze one run.
///
/// Per-pair and per-sub-batch failures are collected in the report. An
/// unusable store fails the run before any request is made; a failed
/// analysis query fails the run after the merge has been committed.
pub async fn run(
    source: Arc<dyn QuoteSource>,
    store: &mut RateStore,
    pairs: &[CurrencyPair],
    max_workers: usize,
    analyzer: Option<&ChangeAnalyzer>,
    now: DateTime<Utc>,
) -> Result<RunReport> {
    store.ensure_ready().context("checking store before fetch")?;

    info!(
        "Fetching {} pair(s) from {} with {} worker(s)",
        pairs.len(),
        source.name(),
        max_workers
    );
    let outcome = fanout::fetch_all(source, pairs, max_workers).await;
    if !outcome.failures.is_empty() {
        let failed: Vec<String> = outcome.failed_pairs().iter().map(|p| p.to_string()).collect();
        warn!("{} pair(s) failed: {}", failed.len(), failed.join(", "));
    }

    let merge = store.merge_batch(&outcome.observations);
    info!(
        "{} row(s) inserted/updated in {} sub-batch(es), {} row(s) failed",
        merge.rows_merged,
        merge.sub_batches,
        merge.failed_rows()
    );

    let changes = match analyzer {
        Some(analyzer) => Some(analyzer.analyze(store, now).context("analyzing stored rates")?),
        None => None,
    };

    Ok(RunReport {
        pairs_requested: pairs.len(),
        observations: outcome.observations.len(),
        fetch_failures: outcome.failures,
        merge,
        changes,
    })
}
