use chrono::{NaiveDate, NaiveTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::InvalidInput;

/// Fractional digits carried by every stored rate.
pub const RATE_SCALE: u32 = 6;

/// Exclusive upper bound on a rate, in whole units. Keeps the micro-unit
/// count below 10^18 so it always fits the store's integer column.
pub const MAX_RATE_UNITS: i64 = 1_000_000_000_000;

/// Ordered currency pair, rendered `BASE/QUOTE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CurrencyPair {
    base: String,
    quote: String,
}

impl CurrencyPair {
    /// Codes are trimmed and upper-cased; anything beyond non-emptiness is
    /// left to the quote source to reject.
    pub fn new(base: &str, quote: &str) -> Result<Self, InvalidInput> {
        let base = base.trim().to_uppercase();
        let quote = quote.trim().to_uppercase();
        if base.is_empty() || quote.is_empty() {
            return Err(InvalidInput::Pair(format!("{}/{}", base, quote)));
        }
        Ok(Self { base, quote })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn quote(&self) -> &str {
        &self.quote
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

impl FromStr for CurrencyPair {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('/')
            .ok_or_else(|| InvalidInput::Pair(s.to_string()))?;
        Self::new(base, quote)
    }
}

impl Serialize for CurrencyPair {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Positive fixed-point rate with exactly six fractional digits.
///
/// Extra precision is rounded half away from zero; zero, negative and values
/// at or above `MAX_RATE_UNITS` are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate(Decimal);

impl Rate {
    pub fn new(value: Decimal) -> Result<Self, InvalidInput> {
        let mut rounded = value.round_dp_with_strategy(RATE_SCALE, RoundingStrategy::MidpointAwayFromZero);
        if rounded <= Decimal::ZERO || rounded >= Decimal::from(MAX_RATE_UNITS) {
            return Err(InvalidInput::Rate(value.to_string()));
        }
        rounded.rescale(RATE_SCALE);
        Ok(Self(rounded))
    }

    pub fn from_micros(micros: i64) -> Result<Self, InvalidInput> {
        Self::new(Decimal::new(micros, RATE_SCALE))
    }

    pub fn to_micros(self) -> i64 {
        // Scale is fixed at six digits and the value is below 10^12, so the
        // mantissa is the micro-unit count and is below 10^18.
        self.0.mantissa() as i64
    }

    pub fn value(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.6}", self.0)
    }
}

impl FromStr for Rate {
    type Err = InvalidInput;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|_| InvalidInput::Rate(s.to_string()))?;
        Self::new(value)
    }
}

impl Serialize for Rate {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One closing rate for one pair on one trading date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateObservation {
    pub pair: CurrencyPair,
    pub rate: Rate,
    pub observed_date: NaiveDate,
    pub event_time_ms: i64,
}

impl RateObservation {
    pub fn new(pair: CurrencyPair, rate: Rate, observed_date: NaiveDate) -> Self {
        Self {
            pair,
            rate,
            observed_date,
            event_time_ms: utc_midnight_millis(observed_date),
        }
    }
}

/// A persisted observation as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRate {
    pub id: i64,
    pub pair: CurrencyPair,
    pub rate: Rate,
    pub observed_date: NaiveDate,
    pub event_time_ms: i64,
    pub ingested_at_ms: i64,
}

pub fn utc_midnight_millis(date: NaiveDate) -> i64 {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

/// Change of the current rate against the reference prior-session rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentChange {
    Percent(Decimal),
    NoReference,
}

impl PercentChange {
    pub fn between(current: Rate, reference: Option<Rate>) -> Self {
        match reference {
            None => Self::NoReference,
            Some(reference) => {
                let change = (current.value() - reference.value()) / reference.value()
                    * Decimal::ONE_HUNDRED;
                Self::Percent(change.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
            }
        }
    }
}

impl fmt::Display for PercentChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(p) => write!(f, "{:.2}%", p),
            Self::NoReference => f.write_str("No Previous Rate"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeRow {
    pub pair: CurrencyPair,
    pub current_rate: Rate,
    pub reference_rate: Option<Rate>,
    #[serde(serialize_with = "serialize_display")]
    pub change: PercentChange,
}

fn serialize_display<S: serde::Serializer>(value: &PercentChange, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
