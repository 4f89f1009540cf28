//! CLI entry point.
//!
//! Loads configuration (TOML file, CLI flags layered on top), connects,
//! runs the extraction pipeline against the given hidden query, and prints
//! the reconstructed SQL next to a per-stage timing summary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use pg_unveil::config::{Config, DbConfig, ExtractionConfig, SamplerConfig};
use pg_unveil::db::Session;
use pg_unveil::error::UnveilError;
use pg_unveil::pipeline::{CancelToken, Pipeline};
use pg_unveil::query_from_context;

#[derive(Debug, Parser)]
#[command(name = "pg_unveil", version, about = "Reconstruct a hidden SQL query by probing its oracle")]
struct Cli {
    /// The hidden query to extract.
    #[arg(long, conflicts_with = "query_file")]
    query: Option<String>,

    /// Read the hidden query from a file instead.
    #[arg(long)]
    query_file: Option<PathBuf>,

    /// TOML configuration file. Optional when connection flags are given.
    #[arg(long, default_value = "unveil.toml")]
    config: PathBuf,

    /// Database name.
    #[arg(long, env = "PGUNVEIL_DBNAME")]
    dbname: Option<String>,

    /// Schema scope.
    #[arg(long, env = "PGUNVEIL_SCHEMA")]
    schema: Option<String>,

    #[arg(long, env = "PGUNVEIL_HOST")]
    host: Option<String>,

    #[arg(long, env = "PGUNVEIL_PORT")]
    port: Option<u16>,

    #[arg(long, env = "PGUNVEIL_USER")]
    user: Option<String>,

    #[arg(long, env = "PGUNVEIL_PASSWORD")]
    password: Option<String>,

    /// Primary/foreign-key sidecar CSV.
    #[arg(long)]
    key_file: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = %e.kind(), "{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), UnveilError> {
    let cli = Cli::parse();
    let cfg = build_config(&cli)?;
    let hidden_query = hidden_query(&cli)?;

    println!("pg_unveil {}\n", env!("CARGO_PKG_VERSION"));

    let mut session = Session::connect(&cfg.database)?;
    let pipeline = Pipeline::new(&mut session, &cfg, hidden_query.clone(), CancelToken::new());
    let result = pipeline.execute()?;

    println!("{:<14} {:>9}", "stage", "seconds");
    for timing in &result.timings {
        println!("{:<14} {:>9.2}", timing.name, timing.elapsed.as_secs_f64());
    }

    println!("\nHidden query");
    println!("===============");
    println!("{hidden_query}");
    println!("\nExtracted query");
    println!("===============");
    println!("{}", query_from_context(&result.ctx)?);

    session.close()?;
    Ok(())
}

/// Configuration file values with CLI flags layered on top. Without a file,
/// the flags must carry the connection parameters.
fn build_config(cli: &Cli) -> Result<Config, UnveilError> {
    let mut cfg = if cli.config.exists() {
        Config::from_file(&cli.config)?
    } else {
        let (Some(dbname), Some(user)) = (cli.dbname.clone(), cli.user.clone()) else {
            return Err(UnveilError::Config(format!(
                "no config file at {} and no --dbname/--user flags",
                cli.config.display()
            )));
        };
        Config {
            database: DbConfig {
                dbname,
                schema: "public".into(),
                host: "localhost".into(),
                port: 5432,
                user,
                password: String::new(),
            },
            key_file: PathBuf::from("./pkfkrelations.csv"),
            sampler: SamplerConfig::default(),
            extraction: ExtractionConfig::default(),
        }
    };

    if let Some(dbname) = &cli.dbname {
        cfg.database.dbname = dbname.clone();
    }
    if let Some(schema) = &cli.schema {
        cfg.database.schema = schema.clone();
    }
    if let Some(host) = &cli.host {
        cfg.database.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.database.port = port;
    }
    if let Some(user) = &cli.user {
        cfg.database.user = user.clone();
    }
    if let Some(password) = &cli.password {
        cfg.database.password = password.clone();
    }
    if let Some(key_file) = &cli.key_file {
        cfg.key_file = key_file.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn hidden_query(cli: &Cli) -> Result<String, UnveilError> {
    if let Some(query) = &cli.query {
        return Ok(query.clone());
    }
    if let Some(path) = &cli.query_file {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| UnveilError::Config(format!("cannot read {}: {e}", path.display())));
    }
    Err(UnveilError::Config(
        "a hidden query is required (--query or --query-file)".into(),
    ))
}
