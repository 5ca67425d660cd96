use crate::analysis::{
    ChangeAnalyzer, ReferenceRule, DEFAULT_CUTOFF_HOUR, DEFAULT_REFERENCE_TZ, DEFAULT_WINDOW_SECS,
};
use crate::fanout::DEFAULT_MAX_WORKERS;
use crate::sources::alpha_vantage::DEFAULT_BASE_URL;
use crate::store::{DEFAULT_BATCH_SIZE, DEFAULT_TABLE};
use crate::types::CurrencyPair;
use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    /// CSV of `base,quote` rows with a header line; resolved against the
    /// config file's directory.
    #[serde(default)]
    pub pairs_file: Option<PathBuf>,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub base: String,
    pub quote: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub max_workers: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub table: String,
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("fx_rates.db"),
            table: DEFAULT_TABLE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub window_secs: u64,
    pub reference_timezone: String,
    pub cutoff_hour: u32,
    pub reference_rule: ReferenceRule,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            reference_timezone: DEFAULT_REFERENCE_TZ.to_string(),
            cutoff_hour: DEFAULT_CUTOFF_HOUR,
            reference_rule: ReferenceRule::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn timezone(&self) -> Result<Tz> {
        self.reference_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("unknown reference_timezone '{}': {}", self.reference_timezone, e))
    }

    pub fn analyzer(&self) -> Result<ChangeAnalyzer> {
        let window_secs = i64::try_from(self.window_secs).context("window_secs out of range")?;
        Ok(ChangeAnalyzer::new(
            chrono::Duration::seconds(window_secs),
            self.timezone()?,
            self.cutoff_hour,
            self.reference_rule,
        ))
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&contents, base_dir).with_context(|| format!("parsing {}", path.display()))
    }

    fn from_yaml(contents: &str, base_dir: &Path) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(contents)?;
        if let Some(file) = &config.pairs_file {
            let file = base_dir.join(file);
            let from_file =
                load_pairs_csv(&file).with_context(|| format!("reading pairs from {}", file.display()))?;
            config.pairs.extend(from_file);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pairs.is_empty() {
            anyhow::bail!("no currency pairs configured (set `pairs` or `pairs_file`)");
        }
        let mut seen = HashSet::new();
        for p in &self.pairs {
            let pair = CurrencyPair::new(&p.base, &p.quote)?;
            if !seen.insert(pair.clone()) {
                anyhow::bail!("duplicate currency pair {}", pair);
            }
        }
        if self.fetch.max_workers == 0 {
            anyhow::bail!("fetch.max_workers must be at least 1");
        }
        if self.store.batch_size == 0 {
            anyhow::bail!("store.batch_size must be at least 1");
        }
        if self.analysis.cutoff_hour > 23 {
            anyhow::bail!("analysis.cutoff_hour must be 0-23, got {}", self.analysis.cutoff_hour);
        }
        self.analysis.timezone()?;
        Ok(())
    }

    pub fn currency_pairs(&self) -> Vec<CurrencyPair> {
        self.pairs
            .iter()
            .filter_map(|p| CurrencyPair::new(&p.base, &p.quote).ok())
            .collect()
    }
}

/// Pairs from a two-column CSV. The header row is skipped whatever its names.
pub fn load_pairs_csv(path: &Path) -> Result<Vec<PairConfig>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let mut pairs = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        match (record.get(0), record.get(1)) {
            (Some(base), Some(quote)) => pairs.push(PairConfig {
                base: base.to_string(),
                quote: quote.to_string(),
            }),
            _ => anyhow::bail!("row {}: expected base,quote", i + 2),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg = Config::from_yaml("pairs:\n  - { base: usd, quote: eur }\n", Path::new(".")).unwrap();
        assert_eq!(cfg.currency_pairs(), vec![CurrencyPair::new("USD", "EUR").unwrap()]);
        assert_eq!(cfg.fetch.max_workers, 10);
        assert_eq!(cfg.store.table, "exchange_rates");
        assert_eq!(cfg.store.batch_size, 1000);
        assert_eq!(cfg.analysis.window_secs, 30);
        assert_eq!(cfg.analysis.cutoff_hour, 17);
        assert_eq!(cfg.analysis.reference_rule, ReferenceRule::PrecedingLastBeforeCutoff);
        assert_eq!(cfg.analysis.timezone().unwrap(), chrono_tz::America::New_York);
        assert_eq!(cfg.source.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn overrides_are_honoured() {
        let yaml = r#"
pairs:
  - { base: USD, quote: JPY }
fetch:
  max_workers: 4
store:
  path: /tmp/rates.db
  table: rates_v2
  batch_size: 250
analysis:
  window_secs: 60
  reference_timezone: Europe/London
  cutoff_hour: 16
  reference_rule: last_before_cutoff
"#;
        let cfg = Config::from_yaml(yaml, Path::new(".")).unwrap();
        assert_eq!(cfg.fetch.max_workers, 4);
        assert_eq!(cfg.store.table, "rates_v2");
        assert_eq!(cfg.store.batch_size, 250);
        assert_eq!(cfg.analysis.reference_rule, ReferenceRule::LastBeforeCutoff);
        assert_eq!(cfg.analysis.timezone().unwrap(), chrono_tz::Europe::London);
        assert!(cfg.analysis.analyzer().is_ok());
    }

    #[test]
    fn pairs_file_is_merged_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = std::fs::File::create(dir.path().join("currency_pairs.csv")).unwrap();
        writeln!(csv, "base_currency,target_currency\nUSD,GBP\n USD , AUD ").unwrap();

        let yaml = "pairs_file: currency_pairs.csv\npairs:\n  - { base: USD, quote: EUR }\n";
        let cfg = Config::from_yaml(yaml, dir.path()).unwrap();
        let pairs: Vec<String> = cfg.currency_pairs().iter().map(|p| p.to_string()).collect();
        assert_eq!(pairs, vec!["USD/EUR", "USD/GBP", "USD/AUD"]);
    }

    #[test]
    fn rejects_invalid_configs() {
        let cases = [
            "pairs: []\n",
            "pairs:\n  - { base: USD, quote: '' }\n",
            "pairs:\n  - { base: USD, quote: EUR }\n  - { base: usd, quote: eur }\n",
            "pairs:\n  - { base: USD, quote: EUR }\nfetch:\n  max_workers: 0\n",
            "pairs:\n  - { base: USD, quote: EUR }\nstore:\n  batch_size: 0\n",
            "pairs:\n  - { base: USD, quote: EUR }\nanalysis:\n  cutoff_hour: 24\n",
            "pairs:\n  - { base: USD, quote: EUR }\nanalysis:\n  reference_timezone: Mars/Olympus\n",
            "pairs:\n  - { base: USD, quote: EUR }\nanalysis:\n  reference_rule: whatever\n",
        ];
        for yaml in cases {
            assert!(Config::from_yaml(yaml, Path::new(".")).is_err(), "accepted: {}", yaml);
        }
    }
}
