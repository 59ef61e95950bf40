//! Application config
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::events::EventKind;
use crate::queue::{BackoffKind, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Kafka,
    Memory,
}

/// job queue the workers consume from
#[derive(Debug, Deserialize)]
pub struct QueueSettings {
    pub kind: QueueKind,
    /// bootstrap brokers, required for kafka
    pub brokers: Option<String>,
    /// consumer group (default: hopper)
    pub group_id: String,
    /// attempts per job before it is dead-lettered (default: 3)
    pub attempts: u32,
    /// retry backoff (default: exponential)
    pub backoff: BackoffKind,
    /// base retry delay (default: 1000)
    pub backoff_delay_ms: u64,
    /// unacknowledged jobs older than this are stalled (default: 30000)
    pub stalled_interval_ms: u64,
    /// suffix of dead-letter topics (default: .dead-letter)
    pub dead_letter_suffix: String,
}

impl QueueSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_millis(self.backoff_delay_ms);
        match self.backoff {
            BackoffKind::Exponential => RetryPolicy::exponential(self.attempts, delay),
            BackoffKind::Fixed => RetryPolicy::fixed(self.attempts, delay),
        }
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_interval_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Http,
    Native,
}

/// ClickHouse connection
#[derive(Debug, Deserialize)]
pub struct SinkSettings {
    pub kind: SinkKind,
    /// URL of ClickHouse, http(s):// for http, tcp:// for native
    pub url: String,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// upper bound of a single insert (default: 30000)
    pub request_timeout_ms: u64,
}

impl SinkSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
pub struct ServerSettings {
    /// address of the health endpoint (default: 0.0.0.0:4000)
    pub listen: SocketAddr,
}

#[derive(Debug, Deserialize)]
pub struct ShutdownSettings {
    /// drain budget for all workers (default: 30)
    pub timeout_seconds: u64,
}

impl ShutdownSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Deserialize)]
pub struct LogSettings {
    /// default filter, RUST_LOG takes precedence (default: info)
    pub level: String,
    pub format: LogFormat,
}

/// per event type overrides, as found in the config
#[derive(Debug, Default, Deserialize)]
struct WorkerOverrides {
    batch_size: Option<usize>,
    flush_interval_ms: Option<u64>,
    concurrency: Option<usize>,
    table: Option<String>,
    enabled: Option<bool>,
}

/// configuration of single event type worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub concurrency: usize,
    /// ClickHouse table to ingest into
    pub table: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub queue: QueueSettings,
    pub sink: SinkSettings,
    pub server: ServerSettings,
    pub shutdown: ShutdownSettings,
    pub log: LogSettings,
    #[serde(default, rename = "workers")]
    overrides: BTreeMap<EventKind, WorkerOverrides>,
    /// every event type with defaults applied
    #[serde(skip)]
    pub workers: BTreeMap<EventKind, WorkerSettings>,
}

impl Settings {
    pub fn new(cfgfile: &str) -> Result<Self, ConfigError> {
        let builder = defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(cfgfile).required(true))
            .add_source(
                Environment::with_prefix("HOPPER")
                    .separator("__")
                    .try_parsing(true),
            );
        Settings::build(builder)
    }

    /// Loads settings from a TOML document, without file or environment lookups
    pub fn from_toml(document: &str) -> Result<Self, ConfigError> {
        Settings::build(defaults()?.add_source(File::from_str(document, FileFormat::Toml)))
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let mut settings: Settings = builder.build()?.try_deserialize()?;
        for kind in EventKind::ALL {
            let cfg = settings.overrides.remove(&kind).unwrap_or_default();
            let defaults = kind.defaults();
            let worker = WorkerSettings {
                batch_size: cfg.batch_size.unwrap_or(defaults.batch_size),
                flush_interval: cfg
                    .flush_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.flush_interval),
                concurrency: cfg.concurrency.unwrap_or(defaults.concurrency),
                table: cfg.table.unwrap_or_else(|| kind.table().to_owned()),
                enabled: cfg.enabled.unwrap_or(true),
            };
            settings.workers.insert(kind, worker);
        }
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.kind == QueueKind::Kafka && self.queue.brokers.is_none() {
            return Err(ConfigError::Message("queue.brokers is required for kafka".into()));
        }
        if self.queue.attempts == 0 {
            return Err(ConfigError::Message("queue.attempts must be at least 1".into()));
        }
        for (kind, worker) in &self.workers {
            let invalid = |field: &str| {
                ConfigError::Message(format!("workers.{}.{field} must be positive", kind.key()))
            };
            if worker.batch_size == 0 {
                return Err(invalid("batch_size"));
            }
            if worker.flush_interval.is_zero() {
                return Err(invalid("flush_interval_ms"));
            }
            if worker.concurrency == 0 {
                return Err(invalid("concurrency"));
            }
        }
        Ok(())
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("queue.kind", "kafka")?
        .set_default("queue.group_id", "hopper")?
        .set_default("queue.attempts", 3)?
        .set_default("queue.backoff", "exponential")?
        .set_default("queue.backoff_delay_ms", 1000)?
        .set_default("queue.stalled_interval_ms", 30_000)?
        .set_default("queue.dead_letter_suffix", ".dead-letter")?
        .set_default("sink.kind", "http")?
        .set_default("sink.url", "http://localhost:8123")?
        .set_default("sink.request_timeout_ms", 30_000)?
        .set_default("server.listen", "0.0.0.0:4000")?
        .set_default("shutdown.timeout_seconds", 30)?
        .set_default("log.level", "info")?
        .set_default("log.format", "json")
}
