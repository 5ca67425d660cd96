use crate::error::FetchError;
use crate::types::{ChangeRow, CurrencyPair, StoredRate};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use serde::Serialize;

#[derive(Serialize)]
struct JsonReport<'a> {
    changes: &'a [ChangeRow],
    failed_pairs: Vec<String>,
}

pub fn print_table(rows: &[ChangeRow]) {
    let mut rows: Vec<&ChangeRow> = rows.iter().collect();
    rows.sort_by(|a, b| a.pair.cmp(&b.pair));

    println!("\n{:<15} {:<15} {:<15}", "Currency Pair", "Current Rate", "% Change");
    println!("{}", "=".repeat(60));
    for r in rows {
        println!(
            "{:<15} {:<15} {:<15}",
            r.pair.to_string(),
            r.current_rate.to_string(),
            r.change.to_string()
        );
    }
    println!();
}

pub fn print_failures(failures: &[FetchError]) {
    if failures.is_empty() {
        return;
    }
    println!("Failed pairs ({}):", failures.len());
    for f in failures {
        println!("  {:<10} {}", f.pair.to_string(), f.kind);
    }
    println!();
}

pub fn print_history(pair: &CurrencyPair, rows: &[StoredRate]) {
    println!("\n{} ({} stored rate(s))", pair, rows.len());
    println!("{:<8} {:<12} {:<15} {:<16} {}", "Id", "Date", "Rate", "Event Time", "Ingested At");
    println!("{}", "-".repeat(80));
    for r in rows {
        let ingested = Utc
            .timestamp_millis_opt(r.ingested_at_ms)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
            .unwrap_or_else(|| r.ingested_at_ms.to_string());
        println!(
            "{:<8} {:<12} {:<15} {:<16} {}",
            r.id,
            r.observed_date.to_string(),
            r.rate.to_string(),
            r.event_time_ms,
            ingested
        );
    }
    println!();
}

pub fn print_json(rows: &[ChangeRow], failures: &[FetchError]) -> Result<()> {
    let report = JsonReport {
        changes: rows,
        failed_pairs: failures.iter().map(|f| f.pair.to_string()).collect(),
    };
    let json = serde_json::to_string_pretty(&report).context("serializing change report")?;
    println!("{}", json);
    Ok(())
}
