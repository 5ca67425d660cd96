use crate::error::{FetchError, FetchErrorKind};
use crate::sources::QuoteSource;
use crate::types::{CurrencyPair, RateObservation};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Observations from every pair that succeeded plus one error per pair that
/// did not. Partial success is the normal outcome.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub observations: Vec<RateObservation>,
    pub failures: Vec<FetchError>,
}

impl FetchOutcome {
    pub fn failed_pairs(&self) -> Vec<&CurrencyPair> {
        self.failures.iter().map(|f| &f.pair).collect()
    }
}

/// Fetch every pair once with at most `max_workers` requests in flight.
///
/// Dropping the returned future aborts all outstanding requests.
pub async fn fetch_all(
    source: Arc<dyn QuoteSource>,
    pairs: &[CurrencyPair],
    max_workers: usize,
) -> FetchOutcome {
    let permits = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();
    // Only consulted when a task panics and its pair is otherwise lost.
    let mut pending = HashMap::with_capacity(pairs.len());

    for pair in pairs {
        let source = Arc::clone(&source);
        let permits = Arc::clone(&permits);
        let task_pair = pair.clone();
        let handle = tasks.spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => source.fetch_pair(&task_pair).await,
                Err(e) => Err(FetchError::new(
                    &task_pair,
                    FetchErrorKind::Task(e.to_string()),
                )),
            };
            (task_pair, result)
        });
        pending.insert(handle.id(), pair.clone());
    }

    let mut outcome = FetchOutcome::default();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((pair, Ok(observations))) => {
                info!("  [{}] {} observation(s)", pair, observations.len());
                outcome.observations.extend(observations);
            }
            Ok((pair, Err(e))) => {
                warn!("  [{}] failed: {}", pair, e.kind);
                outcome.failures.push(e);
            }
            Err(join_err) => {
                let Some(pair) = pending.remove(&join_err.id()) else {
                    warn!("fetch task {} ended without a known pair: {}", join_err.id(), join_err);
                    continue;
                };
                warn!("  [{}] task failed: {}", pair, join_err);
                outcome.failures.push(FetchError::new(
                    &pair,
                    FetchErrorKind::Task(join_err.to_string()),
                ));
            }
        }
    }

    outcome
}
