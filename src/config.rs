use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub catalog_path: String,
    pub sweep_interval_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bucket usage metering service")]
pub struct Args {
    /// Host to bind to (overrides BUCKET_METER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_METER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides BUCKET_METER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Path to the bucket catalog JSON file (overrides BUCKET_METER_CATALOG)
    #[arg(long)]
    pub catalog: Option<String>,

    /// Seconds between automatic sweeps (overrides BUCKET_METER_SWEEP_INTERVAL)
    #[arg(long)]
    pub sweep_interval: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("BUCKET_METER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("BUCKET_METER_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing BUCKET_METER_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading BUCKET_METER_PORT"),
        };
        let env_db = env::var("BUCKET_METER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/bucket_meter.db".into());
        let env_catalog =
            env::var("BUCKET_METER_CATALOG").unwrap_or_else(|_| "./data/buckets.json".into());
        let env_interval = match env::var("BUCKET_METER_SWEEP_INTERVAL") {
            Ok(value) => value.parse::<u64>().with_context(|| {
                format!("parsing BUCKET_METER_SWEEP_INTERVAL value `{}`", value)
            })?,
            Err(env::VarError::NotPresent) => 3600,
            Err(err) => return Err(err).context("reading BUCKET_METER_SWEEP_INTERVAL"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            catalog_path: args.catalog.unwrap_or(env_catalog),
            sweep_interval_secs: args.sweep_interval.unwrap_or(env_interval),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
