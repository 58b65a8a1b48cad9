//! Configuration management for the fraud stream pipeline

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an alternative config file
pub const CONFIG_PATH_ENV: &str = "FRAUD_PIPELINE_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub stream: StreamConfig,
    pub reporter: ReporterConfig,
    pub models: ModelsConfig,
    pub detection: DetectionConfig,
    pub bus: BusConfig,
    pub history: HistoryConfig,
    pub pipeline: PipelineConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Inbound SSE transaction stream
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Stream endpoint URL
    pub url: String,
    /// Value sent in the `X-API-Key` header
    pub api_key: String,
    /// First reconnect delay; doubles on consecutive failures
    pub reconnect_delay_ms: u64,
    /// Upper bound for the reconnect delay
    pub max_reconnect_delay_ms: u64,
    /// TCP/TLS connect timeout
    pub connect_timeout_ms: u64,
    /// Rebuild the connection when no bytes arrive for this long (0 disables)
    pub idle_timeout_secs: u64,
    /// Largest single event frame accepted before the session is dropped
    pub max_event_bytes: usize,
    /// Accept self-signed certificates on the stream endpoint
    pub accept_invalid_certs: bool,
}

impl StreamConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8443/stream".to_string(),
            api_key: String::new(),
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
            idle_timeout_secs: 60,
            max_event_bytes: 1 << 20,
            accept_invalid_certs: false,
        }
    }
}

/// Outbound flag reporting
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Flag endpoint URL
    pub url: String,
    /// Value sent in the `X-API-Key` header
    pub api_key: String,
    /// Per-request timeout
    pub timeout_ms: u64,
    /// Retries after a transient failure (timeout, network, 5xx, 429)
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per retry
    pub retry_backoff_ms: u64,
    /// Case-insensitive fragments of a rejection reason meaning "already satisfied"
    pub duplicate_markers: Vec<String>,
    /// How many reported trans_nums are remembered locally
    pub memo_capacity: usize,
    /// Accept self-signed certificates on the flag endpoint
    pub accept_invalid_certs: bool,
}

impl ReporterConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8443/api/flag".to_string(),
            api_key: String::new(),
            timeout_ms: 5000,
            max_retries: 2,
            retry_backoff_ms: 250,
            duplicate_markers: vec!["already".to_string(), "expired".to_string()],
            memo_capacity: 10_000,
            accept_invalid_certs: false,
        }
    }
}

/// Classifier artifact configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// ONNX model file
    pub model_path: String,
    /// Feature column schema the model was trained with
    pub columns_path: String,
    /// Output class index the model uses for fraud (0 or 1)
    pub fraud_class: u8,
    /// Number of threads for ONNX inference
    pub onnx_threads: usize,
    /// Upper bound for a single scoring call
    pub timeout_ms: u64,
}

impl ModelsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            model_path: "models/model.onnx".to_string(),
            columns_path: "models/columns.json".to_string(),
            fraud_class: 1,
            onnx_threads: 1,
            timeout_ms: 1000,
        }
    }
}

/// Detection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// A transaction is fraud when its probability is strictly above this value
    pub threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { threshold: 0.5 }
    }
}

/// Live subscriber fan-out
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Buffered events per subscriber before drop-newest kicks in
    pub subscriber_buffer: usize,
    /// Idle time after which a subscriber receives a ping
    pub keepalive_secs: u64,
}

impl BusConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            keepalive_secs: 15,
        }
    }
}

/// Replay history
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 1000 }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum transactions processed concurrently
    pub workers: usize,
    /// Bound of the ingestion hand-off channel
    pub channel_capacity: usize,
    /// How many recent trans_nums are remembered for duplicate suppression
    pub dedupe_window: usize,
    /// Interval of the periodic metrics summary (0 disables)
    pub metrics_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            channel_capacity: 1024,
            dedupe_window: 10_000,
            metrics_interval_secs: 30,
        }
    }
}

/// Retention beyond the history ring
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub enabled: bool,
    /// Events kept by the in-process store; the oldest are evicted first
    pub capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: 100_000,
        }
    }
}

/// Query and subscription HTTP surface
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    pub bind: String,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("Invalid server bind address: {}", self.bind))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8000".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `$FRAUD_PIPELINE_CONFIG` or `config/config.toml`
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path, layered with `FRAUD__*` env vars.
    ///
    /// A missing file is not an error: every field has a default.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(Environment::with_prefix("FRAUD").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.detection.threshold),
            "detection.threshold must be within [0, 1], got {}",
            self.detection.threshold
        );
        ensure!(
            self.models.fraud_class <= 1,
            "models.fraud_class must be 0 or 1, got {}",
            self.models.fraud_class
        );
        ensure!(self.history.capacity > 0, "history.capacity must be positive");
        ensure!(self.bus.subscriber_buffer > 0, "bus.subscriber_buffer must be positive");
        ensure!(self.bus.keepalive_secs > 0, "bus.keepalive_secs must be positive");
        ensure!(self.stream.max_event_bytes > 0, "stream.max_event_bytes must be positive");
        ensure!(self.store.capacity > 0, "store.capacity must be positive");
        ensure!(self.pipeline.workers > 0, "pipeline.workers must be positive");
        ensure!(
            self.pipeline.channel_capacity > 0,
            "pipeline.channel_capacity must be positive"
        );
        ensure!(
            self.stream.max_reconnect_delay_ms >= self.stream.reconnect_delay_ms,
            "stream.max_reconnect_delay_ms must not be below stream.reconnect_delay_ms"
        );
        Ok(())
    }
}
