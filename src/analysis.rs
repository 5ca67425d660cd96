use crate::error::AnalysisError;
use crate::store::{RateStore, DATE_COLUMN_FORMAT};
use crate::types::{ChangeRow, CurrencyPair, PercentChange, Rate};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rusqlite::params;
use serde::Deserialize;
use tracing::{debug, info};

pub const DEFAULT_WINDOW_SECS: u64 = 30;
pub const DEFAULT_CUTOFF_HOUR: u32 = 17;
pub const DEFAULT_REFERENCE_TZ: Tz = chrono_tz::America::New_York;

/// Which pre-cutoff row serves as the reference rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceRule {
    /// The row immediately before the latest row dated at or before the cutoff.
    #[default]
    PrecedingLastBeforeCutoff,
    /// The latest row dated at or before the cutoff.
    LastBeforeCutoff,
}

/// Resolves, per pair, the current rate from the latest ingestion run and the
/// reference rate as of the prior session close.
#[derive(Debug, Clone)]
pub struct ChangeAnalyzer {
    window: Duration,
    timezone: Tz,
    cutoff_hour: u32,
    rule: ReferenceRule,
}

impl Default for ChangeAnalyzer {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_WINDOW_SECS as i64),
            DEFAULT_REFERENCE_TZ,
            DEFAULT_CUTOFF_HOUR,
            ReferenceRule::default(),
        )
    }
}

impl ChangeAnalyzer {
    pub fn new(window: Duration, timezone: Tz, cutoff_hour: u32, rule: ReferenceRule) -> Self {
        Self {
            window,
            timezone,
            cutoff_hour,
            rule,
        }
    }

    /// `cutoff_hour` on the calendar day before `now`, both in the reference
    /// zone, expressed in UTC.
    pub fn reference_cutoff(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, AnalysisError> {
        let local_today = now.with_timezone(&self.timezone).date_naive();
        let yesterday = local_today
            .pred_opt()
            .ok_or_else(|| AnalysisError::Cutoff(format!("no day before {}", local_today)))?;
        let at = NaiveTime::from_hms_opt(self.cutoff_hour, 0, 0)
            .ok_or_else(|| AnalysisError::Cutoff(format!("invalid cutoff hour {}", self.cutoff_hour)))?;
        let local = self
            .timezone
            .from_local_datetime(&yesterday.and_time(at))
            .earliest()
            .ok_or_else(|| {
                AnalysisError::Cutoff(format!("{} {} does not exist in {}", yesterday, at, self.timezone))
            })?;
        Ok(local.with_timezone(&Utc))
    }

    /// Change rows for every pair with a rate in the active window. Read-only.
    pub fn analyze(&self, store: &RateStore, now: DateTime<Utc>) -> Result<Vec<ChangeRow>, AnalysisError> {
        let cutoff = self.reference_cutoff(now)?;
        let cutoff_str = cutoff.format(DATE_COLUMN_FORMAT).to_string();
        let include_cutoff_row = self.rule == ReferenceRule::LastBeforeCutoff;
        debug!(
            "analyzing `{}`: window={}s cutoff={} UTC rule={:?}",
            store.table(),
            self.window.num_seconds(),
            cutoff_str,
            self.rule
        );

        let sql = format!(
            "WITH active AS (
                SELECT id, ccy_couple, rate, event_time
                FROM {t}
                WHERE ingested_at >= (SELECT MAX(ingested_at) FROM {t}) - ?1
            ),
            latest AS (
                SELECT ccy_couple, rate AS current_rate
                FROM (
                    SELECT ccy_couple, rate,
                           ROW_NUMBER() OVER (
                               PARTITION BY ccy_couple ORDER BY event_time DESC, id DESC
                           ) AS rn
                    FROM active
                )
                WHERE rn = 1
            ),
            last_before_cutoff AS (
                SELECT ccy_couple, MAX(event_time) AS cutoff_event_time
                FROM {t}
                WHERE date <= ?2
                GROUP BY ccy_couple
            ),
            reference AS (
                SELECT ccy_couple, rate AS reference_rate
                FROM (
                    SELECT r.ccy_couple, r.rate,
                           ROW_NUMBER() OVER (
                               PARTITION BY r.ccy_couple ORDER BY r.event_time DESC, r.id DESC
                           ) AS rn
                    FROM {t} r
                    JOIN last_before_cutoff c ON c.ccy_couple = r.ccy_couple
                    WHERE r.event_time < c.cutoff_event_time
                       OR (?3 AND r.event_time = c.cutoff_event_time)
                )
                WHERE rn = 1
            )
            SELECT l.ccy_couple, l.current_rate, p.reference_rate
            FROM latest l
            LEFT JOIN reference p ON p.ccy_couple = l.ccy_couple
            ORDER BY l.ccy_couple",
            t = store.table()
        );

        let conn = store.connection();
        let mut stmt = conn.prepare(&sql)?;
        let raw = stmt
            .query_map(
                params![self.window.num_milliseconds(), cutoff_str, include_cutoff_row],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (pair, current, reference) in raw {
            let corrupt = |reason: String| AnalysisError::CorruptRow {
                pair: pair.clone(),
                reason,
            };
            let parsed: CurrencyPair = pair.parse().map_err(|e| corrupt(format!("{}", e)))?;
            let current_rate = Rate::from_micros(current).map_err(|e| corrupt(format!("{}", e)))?;
            let reference_rate = reference
                .map(Rate::from_micros)
                .transpose()
                .map_err(|e| corrupt(format!("{}", e)))?;
            rows.push(ChangeRow {
                change: PercentChange::between(current_rate, reference_rate),
                pair: parsed,
                current_rate,
                reference_rate,
            });
        }

        info!("Computed change for {} pair(s)", rows.len());
        Ok(rows)
    }
}
