//! Run configuration.
//!
//! A run is described by a [`Config`]: connection parameters, the path of
//! the primary/foreign-key sidecar file, sampler tuning, and the numeric
//! refinement precision. Values come from an optional TOML file with CLI
//! flags layered on top (the CLI lives in `main.rs`).

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::UnveilError;

/// Connection parameters for the target database.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub dbname: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_schema() -> String {
    "public".into()
}

fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    5432
}

impl DbConfig {
    /// Render a libpq-style connection string for the driver.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

/// Correlated-sampler tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Initial TABLESAMPLE percentage.
    #[serde(default = "default_initial_percent")]
    pub initial_percent: f64,
    /// Factor applied to the percentage after a failed attempt.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Attempt cap before falling back to the full instance.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_initial_percent() -> f64 {
    0.16
}

fn default_multiplier() -> f64 {
    10.0
}

fn default_max_attempts() -> u32 {
    100
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            initial_percent: default_initial_percent(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Extraction tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionConfig {
    /// Decimal places for the refined phase of numeric bound searches.
    #[serde(default = "default_precision")]
    pub numeric_precision: u32,
    /// Iteration cap for the forbidden-α escalation loop.
    #[serde(default = "default_alpha_cap")]
    pub forbidden_alpha_cap: u32,
    /// Lower end of the random assignment range in the projection solve,
    /// used for attributes with no extracted bounds.
    #[serde(default = "default_solve_min")]
    pub solve_range_min: i64,
    /// Upper end of the random assignment range in the projection solve.
    #[serde(default = "default_solve_max")]
    pub solve_range_max: i64,
    /// Whether to attempt best-effort ORDER BY recovery.
    #[serde(default = "default_true")]
    pub recover_order_by: bool,
}

fn default_precision() -> u32 {
    2
}

fn default_alpha_cap() -> u32 {
    16
}

fn default_solve_min() -> i64 {
    1
}

fn default_solve_max() -> i64 {
    999
}

fn default_true() -> bool {
    true
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            numeric_precision: default_precision(),
            forbidden_alpha_cap: default_alpha_cap(),
            solve_range_min: default_solve_min(),
            solve_range_max: default_solve_max(),
            recover_order_by: default_true(),
        }
    }
}

/// Complete run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DbConfig,
    /// Path of the six-column primary/foreign-key CSV.
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
}

fn default_key_file() -> PathBuf {
    PathBuf::from("./pkfkrelations.csv")
}

impl Config {
    /// Load a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, UnveilError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| UnveilError::Config(format!("cannot read {}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&raw)
            .map_err(|e| UnveilError::Config(format!("cannot parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), UnveilError> {
        if self.sampler.initial_percent <= 0.0 || self.sampler.initial_percent > 100.0 {
            return Err(UnveilError::Config(
                "sampler.initial_percent must be in (0, 100]".into(),
            ));
        }
        if self.sampler.multiplier <= 1.0 {
            return Err(UnveilError::Config(
                "sampler.multiplier must be greater than 1".into(),
            ));
        }
        if self.extraction.numeric_precision > 10 {
            return Err(UnveilError::Config(
                "extraction.numeric_precision must be at most 10".into(),
            ));
        }
        if self.extraction.solve_range_min >= self.extraction.solve_range_max {
            return Err(UnveilError::Config(
                "extraction.solve_range_min must be below solve_range_max".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            dbname = "tpch"
            user = "postgres"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.database.schema, "public");
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.sampler.initial_percent, 0.16);
        assert_eq!(cfg.sampler.max_attempts, 100);
        assert_eq!(cfg.extraction.numeric_precision, 2);
        assert!(cfg.extraction.recover_order_by);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_connection_string() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            dbname = "tpch"
            user = "u"
            password = "p"
            host = "db.internal"
            port = 5433
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.database.connection_string(),
            "host=db.internal port=5433 user=u password=p dbname=tpch"
        );
    }

    #[test]
    fn test_validation_rejects_bad_sampler() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            dbname = "d"
            user = "u"
            [sampler]
            initial_percent = 0.0
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_inverted_solve_range() {
        let cfg: Config = toml::from_str(
            r#"
            [database]
            dbname = "d"
            user = "u"
            [extraction]
            solve_range_min = 10
            solve_range_max = 5
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
