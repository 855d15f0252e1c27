use anyhow::{Context, Result, ensure};
use clap::{Args, ValueEnum};
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LISTEN_ADDRESS: &str = "127.0.0.1:9869";
pub const DEFAULT_CLASH_ADDRESS: &str = "127.0.0.1:9090";
pub const DEFAULT_CLASH_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_COLLECT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// What to do when Clash returns a body that is not a valid snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Stop collecting and exit the process with an error.
    #[default]
    Exit,
    /// Log the failure, keep the previous metrics and retry next interval.
    Skip,
}

/// Command line / environment overrides. Every field is optional so that a
/// config file can fill in whatever is not given here.
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Path to configuration TOML file
    #[arg(long, env = "CLASH_EXPORTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to listen on [default: 127.0.0.1:9869]
    #[arg(long, env = "CLASH_EXPORTER_LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Address of the clash API [default: 127.0.0.1:9090]
    #[arg(long, env = "CLASH_EXPORTER_CLASH_ADDRESS")]
    pub clash_address: Option<String>,

    /// Timeout for reading from the clash API [default: 5s]
    #[arg(long, env = "CLASH_EXPORTER_CLASH_TIMEOUT")]
    pub clash_timeout: Option<humantime::Duration>,

    /// Interval to collect metrics from clash [default: 30s]
    #[arg(long, env = "CLASH_EXPORTER_COLLECT_INTERVAL")]
    pub collect_interval: Option<humantime::Duration>,

    /// Path to serve metrics at [default: /metrics]
    #[arg(long, env = "CLASH_EXPORTER_METRICS_PATH")]
    pub metrics_path: Option<String>,

    /// Log level used when RUST_LOG is unset [default: info]
    #[arg(long, env = "CLASH_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Behaviour when the clash API returns malformed JSON [default: exit]
    #[arg(long, value_enum, env = "CLASH_EXPORTER_ON_DECODE_ERROR")]
    pub on_decode_error: Option<DecodeErrorPolicy>,
}

/// Contents of the optional TOML config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub listen_address: Option<String>,
    pub clash_address: Option<String>,
    #[serde(deserialize_with = "humantime_opt")]
    pub clash_timeout: Option<Duration>,
    #[serde(deserialize_with = "humantime_opt")]
    pub collect_interval: Option<Duration>,
    pub metrics_path: Option<String>,
    pub log_level: Option<String>,
    pub on_decode_error: Option<DecodeErrorPolicy>,
}

impl FileConfig {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(&path).with_context(|| {
            format!(
                "Failed to read config file at {}",
                path.as_ref().to_string_lossy()
            )
        })?;
        let cfg: FileConfig = toml::from_str(&data).context("Failed to parse TOML config")?;
        Ok(cfg)
    }
}

fn is_plain_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.' | '~')
}

fn humantime_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

/// Fully resolved exporter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub listen_address: String,
    pub clash_address: String,
    pub clash_timeout: Duration,
    pub collect_interval: Duration,
    pub metrics_path: String,
    pub log_level: String,
    pub on_decode_error: DecodeErrorPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            clash_address: DEFAULT_CLASH_ADDRESS.to_string(),
            clash_timeout: DEFAULT_CLASH_TIMEOUT,
            collect_interval: DEFAULT_COLLECT_INTERVAL,
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            on_decode_error: DecodeErrorPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Resolve flags/env over the config file (if any) over defaults, then validate.
    pub fn resolve(args: ConfigArgs) -> Result<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load_from_path(path)?,
            None => FileConfig::default(),
        };
        let cfg = Self::merge(args, file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn merge(args: ConfigArgs, file: FileConfig) -> Self {
        let defaults = Self::default();
        Self {
            listen_address: args
                .listen_address
                .or(file.listen_address)
                .unwrap_or(defaults.listen_address),
            clash_address: args
                .clash_address
                .or(file.clash_address)
                .unwrap_or(defaults.clash_address),
            clash_timeout: args
                .clash_timeout
                .map(|d| *d)
                .or(file.clash_timeout)
                .unwrap_or(defaults.clash_timeout),
            collect_interval: args
                .collect_interval
                .map(|d| *d)
                .or(file.collect_interval)
                .unwrap_or(defaults.collect_interval),
            metrics_path: args
                .metrics_path
                .or(file.metrics_path)
                .unwrap_or(defaults.metrics_path),
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or(defaults.log_level),
            on_decode_error: args
                .on_decode_error
                .or(file.on_decode_error)
                .unwrap_or(defaults.on_decode_error),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.listen_address.trim().is_empty(),
            "listen address must not be empty"
        );
        ensure!(
            !self.clash_address.trim().is_empty(),
            "clash address must not be empty"
        );
        ensure!(
            !self.clash_timeout.is_zero(),
            "clash timeout must be greater than zero"
        );
        ensure!(
            !self.collect_interval.is_zero(),
            "collect interval must be greater than zero"
        );
        ensure!(
            self.metrics_path.starts_with('/') && self.metrics_path != "/",
            "metrics path must start with '/' and must not be the root path, got {:?}",
            self.metrics_path
        );
        // Plain literal segments only: no route captures, no HTML-significant characters.
        ensure!(
            self.metrics_path.chars().all(is_plain_path_char),
            "metrics path may only contain ASCII letters, digits, '/', '-', '_', '.' and '~', got {:?}",
            self.metrics_path
        );
        Ok(())
    }
}
