pub mod alpha_vantage;

use crate::error::FetchError;
use crate::types::{CurrencyPair, RateObservation};
use async_trait::async_trait;

/// A remote quote source returning the daily closing series for one pair.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &str;
    async fn fetch_pair(&self, pair: &CurrencyPair) -> Result<Vec<RateObservation>, FetchError>;
}
