use std::fs::read_to_string;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match value {
            "error" => Self::Error,
            "warn" => Self::Warn,
            "info" => Self::Info,
            "debug" => Self::Debug,
            "trace" => Self::Trace,
            _ => return Err(format!("unknown log level: {value}")),
        })
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

/// Everything a `--config` file may supply. Every field is optional here;
/// a CLI flag or environment variable, when present, takes precedence.
#[derive(Deserialize, Default, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
struct FileConfig {
    relay_port: Option<u16>,
    relay_public_host: Option<String>,
    relay_db_path: Option<String>,
    queue_max_per_agent: Option<usize>,
    queue_ttl_hours: Option<u64>,
    rate_limit_sustained: Option<f64>,
    rate_limit_burst: Option<f64>,
    pending_key_ttl_hours: Option<u64>,
    pending_sweep_interval_minutes: Option<u64>,
    register_rate_limit: Option<f64>,
    register_rate_burst: Option<f64>,
    bot_challenge_site_key: Option<String>,
    bot_challenge_secret_key: Option<String>,
    allowed_origins: Option<Vec<String>>,
    log_level: Option<LogLevel>,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS"),
)]
struct Cli {
    /// Path to an optional JSON5 config file. CLI flags and environment
    /// variables always win over values read from this file.
    #[arg(long, short)]
    config: Option<String>,

    #[arg(long, env = "RELAY_PORT")]
    relay_port: Option<u16>,
    #[arg(long, env = "RELAY_PUBLIC_HOST")]
    relay_public_host: Option<String>,
    #[arg(long, env = "RELAY_DB_PATH")]
    relay_db_path: Option<String>,
    #[arg(long, env = "QUEUE_MAX_PER_AGENT")]
    queue_max_per_agent: Option<usize>,
    #[arg(long, env = "QUEUE_TTL_HOURS")]
    queue_ttl_hours: Option<u64>,
    #[arg(long, env = "RATE_LIMIT_SUSTAINED")]
    rate_limit_sustained: Option<f64>,
    #[arg(long, env = "RATE_LIMIT_BURST")]
    rate_limit_burst: Option<f64>,
    #[arg(long, env = "PENDING_KEY_TTL_HOURS")]
    pending_key_ttl_hours: Option<u64>,
    #[arg(long, env = "PENDING_SWEEP_INTERVAL_MINUTES")]
    pending_sweep_interval_minutes: Option<u64>,
    #[arg(long, env = "REGISTER_RATE_LIMIT")]
    register_rate_limit: Option<f64>,
    #[arg(long, env = "REGISTER_RATE_BURST")]
    register_rate_burst: Option<f64>,
    #[arg(long, env = "BOT_CHALLENGE_SITE_KEY")]
    bot_challenge_site_key: Option<String>,
    #[arg(long, env = "BOT_CHALLENGE_SECRET_KEY")]
    bot_challenge_secret_key: Option<String>,
    /// Comma-separated list of scheme+host origins permitted on `/ws`.
    #[arg(long, env = "ALLOWED_ORIGINS")]
    allowed_origins: Option<String>,
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<LogLevel>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub relay_port: u16,
    pub relay_public_host: String,
    pub relay_db_path: String,
    pub queue_max_per_agent: usize,
    pub queue_ttl_hours: u64,
    pub rate_limit_sustained: f64,
    pub rate_limit_burst: f64,
    pub pending_key_ttl_hours: u64,
    pub pending_sweep_interval_minutes: u64,
    pub register_rate_limit: f64,
    pub register_rate_burst: f64,
    pub bot_challenge_site_key: Option<String>,
    pub bot_challenge_secret_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub log_level: LogLevel,
}

impl Config {
    fn defaults() -> FileConfig {
        FileConfig {
            relay_port: Some(8080),
            relay_public_host: None,
            relay_db_path: Some("./pinch-relay.db".to_string()),
            queue_max_per_agent: Some(1000),
            queue_ttl_hours: Some(168),
            rate_limit_sustained: Some(1.0),
            rate_limit_burst: Some(10.0),
            pending_key_ttl_hours: Some(24),
            pending_sweep_interval_minutes: Some(15),
            register_rate_limit: Some(1.0),
            register_rate_burst: Some(5.0),
            bot_challenge_site_key: None,
            bot_challenge_secret_key: None,
            allowed_origins: Some(Vec::new()),
            log_level: Some(LogLevel::Info),
        }
    }

    /// CLI flags and environment variables (both surfaced by `Cli`) win
    /// over a `--config` file, which wins over the struct-level defaults.
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();

        let file = match &cli.config {
            Some(path) => serde_json5::from_str::<FileConfig>(
                &read_to_string(path).with_context(|| format!("reading config file {path}"))?,
            )
            .with_context(|| format!("parsing config file {path}"))?,
            None => FileConfig::default(),
        };

        let defaults = Self::defaults();

        let relay_public_host = cli
            .relay_public_host
            .or(file.relay_public_host)
            .or(defaults.relay_public_host)
            .context("relay-public-host is required")?;

        Ok(Self {
            relay_port: cli.relay_port.or(file.relay_port).or(defaults.relay_port).unwrap(),
            relay_public_host,
            relay_db_path: cli.relay_db_path.or(file.relay_db_path).or(defaults.relay_db_path).unwrap(),
            queue_max_per_agent: cli
                .queue_max_per_agent
                .or(file.queue_max_per_agent)
                .or(defaults.queue_max_per_agent)
                .unwrap(),
            queue_ttl_hours: cli.queue_ttl_hours.or(file.queue_ttl_hours).or(defaults.queue_ttl_hours).unwrap(),
            rate_limit_sustained: cli
                .rate_limit_sustained
                .or(file.rate_limit_sustained)
                .or(defaults.rate_limit_sustained)
                .unwrap(),
            rate_limit_burst: cli.rate_limit_burst.or(file.rate_limit_burst).or(defaults.rate_limit_burst).unwrap(),
            pending_key_ttl_hours: cli
                .pending_key_ttl_hours
                .or(file.pending_key_ttl_hours)
                .or(defaults.pending_key_ttl_hours)
                .unwrap(),
            pending_sweep_interval_minutes: cli
                .pending_sweep_interval_minutes
                .or(file.pending_sweep_interval_minutes)
                .or(defaults.pending_sweep_interval_minutes)
                .unwrap(),
            register_rate_limit: cli
                .register_rate_limit
                .or(file.register_rate_limit)
                .or(defaults.register_rate_limit)
                .unwrap(),
            register_rate_burst: cli
                .register_rate_burst
                .or(file.register_rate_burst)
                .or(defaults.register_rate_burst)
                .unwrap(),
            bot_challenge_site_key: cli.bot_challenge_site_key.or(file.bot_challenge_site_key),
            bot_challenge_secret_key: cli.bot_challenge_secret_key.or(file.bot_challenge_secret_key),
            allowed_origins: cli
                .allowed_origins
                .map(|origins| origins.split(',').map(str::trim).map(str::to_string).collect())
                .or(file.allowed_origins)
                .or(defaults.allowed_origins)
                .unwrap(),
            log_level: cli.log_level.or(file.log_level).or(defaults.log_level).unwrap(),
        })
    }

    /// Locked mode is on iff both bot-mitigation credentials are configured.
    pub fn locked_mode(&self) -> bool {
        self.bot_challenge_site_key.is_some() && self.bot_challenge_secret_key.is_some()
    }

    pub fn queue_ttl_nanos(&self) -> i64 {
        self.queue_ttl_hours as i64 * 60 * 60 * 1_000_000_000
    }

    pub fn pending_key_ttl_nanos(&self) -> i64 {
        self.pending_key_ttl_hours as i64 * 60 * 60 * 1_000_000_000
    }
}
