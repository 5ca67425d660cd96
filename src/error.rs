use crate::types::{CurrencyPair, RateObservation};
use thiserror::Error;

/// Rejected pair codes or rate values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidInput {
    #[error("invalid currency pair '{0}' (expected BASE/QUOTE)")]
    Pair(String),

    #[error("invalid rate '{0}' (must be a positive decimal)")]
    Rate(String),
}

/// A single pair's fetch failed. Never fatal for the run.
#[derive(Error, Debug)]
#[error("fetch failed for {pair}: {kind}")]
pub struct FetchError {
    pub pair: CurrencyPair,
    pub kind: FetchErrorKind,
}

impl FetchError {
    pub fn new(pair: &CurrencyPair, kind: FetchErrorKind) -> Self {
        Self {
            pair: pair.clone(),
            kind,
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchErrorKind {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("source rejected request: {0}")]
    Rejected(String),

    #[error("unexpected payload: {0}")]
    Payload(String),

    #[error("task aborted: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    /// The store cannot be used at all; the run stops before fetching.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// One sub-batch was rolled back; other sub-batches are unaffected.
    #[error("sub-batch of {} row(s) failed: {source}", .rows.len())]
    SubBatch {
        rows: Vec<RateObservation>,
        #[source]
        source: rusqlite::Error,
    },
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("store read failed: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("cannot resolve reference cutoff: {0}")]
    Cutoff(String),

    #[error("corrupt row for '{pair}': {reason}")]
    CorruptRow { pair: String, reason: String },
}
