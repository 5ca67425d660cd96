use crate::error::PersistenceError;
use crate::types::{CurrencyPair, Rate, RateObservation, StoredRate};
use chrono::NaiveDate;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, error, info};

pub const DEFAULT_TABLE: &str = "exchange_rates";
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Store clock in epoch milliseconds, evaluated by SQLite at write time.
const NOW_MILLIS_SQL: &str = "CAST((julianday('now') - 2440587.5) * 86400000.0 AS INTEGER)";

/// `date` column format; lexical order matches chronological order.
pub const DATE_COLUMN_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default)]
pub struct MergeReport {
    pub rows_merged: usize,
    pub sub_batches: usize,
    pub failures: Vec<PersistenceError>,
}

impl MergeReport {
    pub fn failed_rows(&self) -> usize {
        self.failures
            .iter()
            .map(|f| match f {
                PersistenceError::SubBatch { rows, .. } => rows.len(),
                PersistenceError::Unavailable(_) => 0,
            })
            .sum()
    }
}

/// SQLite-backed rate table keyed on `(ccy_couple, date)`.
pub struct RateStore {
    conn: Connection,
    table: String,
    batch_size: usize,
}

impl RateStore {
    /// Open an existing database. A missing file is reported as
    /// `Unavailable` rather than silently created.
    pub fn open(path: &Path, table: &str, batch_size: usize) -> Result<Self, PersistenceError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| {
            PersistenceError::Unavailable(format!("opening {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn, table, batch_size)
    }

    /// Open the database, creating the file if needed. Used for schema setup.
    pub fn open_or_create(path: &Path, table: &str, batch_size: usize) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(|e| {
            PersistenceError::Unavailable(format!("opening {}: {}", path.display(), e))
        })?;
        Self::from_connection(conn, table, batch_size)
    }

    pub fn open_in_memory(table: &str, batch_size: usize) -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| PersistenceError::Unavailable(format!("in-memory database: {}", e)))?;
        Self::from_connection(conn, table, batch_size)
    }

    fn from_connection(conn: Connection, table: &str, batch_size: usize) -> Result<Self, PersistenceError> {
        if !is_valid_identifier(table) {
            return Err(PersistenceError::Unavailable(format!(
                "invalid table name '{}'",
                table
            )));
        }
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            table: table.to_string(),
            batch_size: batch_size.max(1),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// One-time schema provisioning; not part of a pipeline run.
    pub fn create_table(&self) -> Result<(), PersistenceError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                event_time  INTEGER NOT NULL,
                ccy_couple  TEXT    NOT NULL,
                rate        INTEGER NOT NULL CHECK (rate > 0 AND rate < 1000000000000000000),
                date        TEXT    NOT NULL,
                ingested_at INTEGER NOT NULL DEFAULT ({now}),
                UNIQUE (ccy_couple, date)
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_ingested_at ON {table} (ingested_at);",
            table = self.table,
            now = NOW_MILLIS_SQL,
        );
        self.conn
            .execute_batch(&ddl)
            .map_err(|e| PersistenceError::Unavailable(format!("creating {}: {}", self.table, e)))?;
        info!("Table `{}` checked/created", self.table);
        Ok(())
    }

    /// Fail fast when the table cannot be read, before any remote call is made.
    pub fn ensure_ready(&self) -> Result<(), PersistenceError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
        if found.is_none() {
            return Err(PersistenceError::Unavailable(format!(
                "table `{}` does not exist (run `init-db` first)",
                self.table
            )));
        }
        Ok(())
    }

    /// Upsert every observation, one transaction per sub-batch.
    ///
    /// A failing sub-batch is rolled back and reported; the remaining
    /// sub-batches are still applied.
    pub fn merge_batch(&mut self, batch: &[RateObservation]) -> MergeReport {
        let sql = format!(
            "INSERT INTO {table} (ccy_couple, rate, event_time, date, ingested_at)
             VALUES (?1, ?2, ?3, ?4, {now})
             ON CONFLICT (ccy_couple, date) DO UPDATE SET
                rate = excluded.rate,
                event_time = excluded.event_time,
                ingested_at = excluded.ingested_at",
            table = self.table,
            now = NOW_MILLIS_SQL,
        );

        let mut report = MergeReport::default();
        for chunk in batch.chunks(self.batch_size) {
            report.sub_batches += 1;
            match merge_chunk(&mut self.conn, &sql, chunk) {
                Ok(n) => {
                    debug!("sub-batch {}: {} row(s) merged", report.sub_batches, n);
                    report.rows_merged += n;
                }
                Err(source) => {
                    error!(
                        "sub-batch {} ({} row(s)) failed: {}",
                        report.sub_batches,
                        chunk.len(),
                        source
                    );
                    report.failures.push(PersistenceError::SubBatch {
                        rows: chunk.to_vec(),
                        source,
                    });
                }
            }
        }
        report
    }

    pub fn row_count(&self) -> rusqlite::Result<u64> {
        self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", self.table),
            [],
            |row| row.get(0),
        )
    }

    /// All stored rows for one pair, oldest first.
    pub fn load_pair(&self, pair: &CurrencyPair) -> rusqlite::Result<Vec<StoredRate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id, rate, date, event_time, ingested_at
             FROM {}
             WHERE ccy_couple = ?1
             ORDER BY event_time ASC, id ASC",
            self.table
        ))?;
        let rows = stmt
            .query_map(params![pair.to_string()], |row| {
                let micros: i64 = row.get(1)?;
                let date: String = row.get(2)?;
                Ok(StoredRate {
                    id: row.get(0)?,
                    pair: pair.clone(),
                    rate: Rate::from_micros(micros).map_err(|e| conversion_error(1, e))?,
                    observed_date: parse_date_column(&date).map_err(|e| conversion_error(2, e))?,
                    event_time_ms: row.get(3)?,
                    ingested_at_ms: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn merge_chunk(conn: &mut Connection, sql: &str, chunk: &[RateObservation]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for obs in chunk {
            stmt.execute(params![
                obs.pair.to_string(),
                obs.rate.to_micros(),
                obs.event_time_ms,
                format_date_column(obs.observed_date),
            ])?;
        }
    }
    tx.commit()?;
    Ok(chunk.len())
}

pub fn format_date_column(date: NaiveDate) -> String {
    date.and_time(chrono::NaiveTime::MIN)
        .format(DATE_COLUMN_FORMAT)
        .to_string()
}

fn parse_date_column(value: &str) -> Result<NaiveDate, chrono::ParseError> {
    chrono::NaiveDateTime::parse_from_str(value, DATE_COLUMN_FORMAT).map(|dt| dt.date())
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(batch_size: usize) -> RateStore {
        let store = RateStore::open_in_memory(DEFAULT_TABLE, batch_size).unwrap();
        store.create_table().unwrap();
        store
    }

    fn obs(pair: &str, rate: &str, date: (i32, u32, u32)) -> RateObservation {
        RateObservation::new(
            pair.parse().unwrap(),
            rate.parse().unwrap(),
            NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        )
    }

    fn snapshot(store: &RateStore, pair: &str) -> Vec<(i64, String, NaiveDate, i64)> {
        store
            .load_pair(&pair.parse().unwrap())
            .unwrap()
            .into_iter()
            .map(|r| (r.id, r.rate.to_string(), r.observed_date, r.event_time_ms))
            .collect()
    }

    #[test]
    fn merging_twice_is_idempotent() {
        let mut store = store(DEFAULT_BATCH_SIZE);
        let batch = vec![
            obs("USD/EUR", "0.918700", (2024, 3, 15)),
            obs("USD/EUR", "0.915000", (2024, 3, 14)),
            obs("USD/JPY", "149.120000", (2024, 3, 15)),
        ];

        let first = store.merge_batch(&batch);
        assert!(first.failures.is_empty());
        let count = store.row_count().unwrap();
        let eur = snapshot(&store, "USD/EUR");

        let second = store.merge_batch(&batch);
        assert!(second.failures.is_empty());
        assert_eq!(store.row_count().unwrap(), count);
        assert_eq!(count, 3);
        assert_eq!(snapshot(&store, "USD/EUR"), eur);
    }

    #[test]
    fn same_key_keeps_one_row_with_latest_rate() {
        let mut store = store(DEFAULT_BATCH_SIZE);
        store.merge_batch(&[obs("USD/GBP", "0.780000", (2024, 3, 15))]);
        let id_before = snapshot(&store, "USD/GBP")[0].0;

        store.merge_batch(&[obs("USD/GBP", "0.785500", (2024, 3, 15))]);
        let rows = snapshot(&store, "USD/GBP");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0, id_before);
        assert_eq!(rows[0].1, "0.785500");
    }

    #[test]
    fn duplicate_key_within_one_batch_does_not_duplicate() {
        let mut store = store(DEFAULT_BATCH_SIZE);
        let report = store.merge_batch(&[
            obs("USD/CAD", "1.350000", (2024, 3, 15)),
            obs("USD/CAD", "1.360000", (2024, 3, 15)),
        ]);
        assert!(report.failures.is_empty());
        let rows = snapshot(&store, "USD/CAD");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, "1.360000");
    }

    #[test]
    fn merge_refreshes_ingested_at_and_keeps_event_time_derived() {
        let mut store = store(DEFAULT_BATCH_SIZE);
        let o = obs("USD/AUD", "1.520000", (2024, 3, 15));
        store.merge_batch(&[o.clone()]);
        store
            .connection()
            .execute("UPDATE exchange_rates SET ingested_at = 0", [])
            .unwrap();

        store.merge_batch(&[o.clone()]);
        let row = &store.load_pair(&o.pair).unwrap()[0];
        assert!(row.ingested_at_ms > 0);
        assert_eq!(row.event_time_ms, o.event_time_ms);
    }

    #[test]
    fn extreme_rates_round_trip_exactly() {
        let mut store = store(DEFAULT_BATCH_SIZE);
        let report = store.merge_batch(&[
            obs("USD/IDR", "999999999999.999999", (2024, 3, 15)),
            obs("USD/IDR", "0.000001", (2024, 3, 14)),
        ]);
        assert!(report.failures.is_empty());

        let rows = snapshot(&store, "USD/IDR");
        assert_eq!(rows[0].1, "0.000001");
        assert_eq!(rows[1].1, "999999999999.999999");
    }

    #[test]
    fn batches_are_split_into_sub_batches() {
        let mut store = store(2);
        let batch: Vec<_> = (1..=5)
            .map(|d| obs("USD/CHF", "0.880000", (2024, 3, d)))
            .collect();
        let report = store.merge_batch(&batch);
        assert_eq!(report.sub_batches, 3);
        assert_eq!(report.rows_merged, 5);
        assert_eq!(store.row_count().unwrap(), 5);
    }

    #[test]
    fn failed_sub_batch_is_rolled_back_and_others_apply() {
        let mut store = store(2);
        store
            .connection()
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON exchange_rates
                 WHEN NEW.ccy_couple = 'BAD/PAIR'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let batch = vec![
            obs("USD/EUR", "0.910000", (2024, 3, 11)),
            obs("USD/EUR", "0.920000", (2024, 3, 12)),
            obs("USD/EUR", "0.930000", (2024, 3, 13)),
            obs("BAD/PAIR", "1.000000", (2024, 3, 13)),
            obs("USD/EUR", "0.950000", (2024, 3, 15)),
        ];
        let report = store.merge_batch(&batch);

        assert_eq!(report.sub_batches, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failed_rows(), 2);
        match &report.failures[0] {
            PersistenceError::SubBatch { rows, .. } => assert_eq!(rows[1].pair.to_string(), "BAD/PAIR"),
            other => panic!("unexpected failure {:?}", other),
        }
        assert_eq!(store.row_count().unwrap(), 3);
    }

    #[test]
    fn missing_table_is_unavailable() {
        let store = RateStore::open_in_memory(DEFAULT_TABLE, DEFAULT_BATCH_SIZE).unwrap();
        assert!(matches!(store.ensure_ready(), Err(PersistenceError::Unavailable(_))));
        store.create_table().unwrap();
        store.ensure_ready().unwrap();
    }

    #[test]
    fn missing_database_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        let err = RateStore::open(&path, DEFAULT_TABLE, DEFAULT_BATCH_SIZE).err().unwrap();
        assert!(matches!(err, PersistenceError::Unavailable(_)));
        assert!(!path.exists());
    }

    #[test]
    fn rejects_unsafe_table_names() {
        for name in ["", "1rates", "rates; DROP TABLE x", "rates-1"] {
            assert!(RateStore::open_in_memory(name, 10).is_err(), "{}", name);
        }
    }
}
