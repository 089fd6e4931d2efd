use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub kafka: KafkaOptions,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub ingress: Option<IngressOptions>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topic: String,
    pub consumer_group: String,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
    pub max_poll_records: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WindowConfig {
    /// Tumbling window span in seconds.
    pub size_seconds: u64,
    /// Number of independent partition-key streams traffic is hashed over.
    pub parallelism: u32,
    /// Fire still-open buckets on graceful shutdown instead of abandoning them.
    pub drain_on_shutdown: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            size_seconds: 5,
            parallelism: 4,
            drain_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub min_pause_ms: u64,
    /// Reference configuration pins this to one in-flight snapshot.
    pub max_concurrent: u32,
    /// Completed epochs kept on disk while the pipeline is running.
    pub retained: usize,
    pub cleanup: CleanupPolicy,
    /// Consecutive failed or timed-out attempts tolerated before the
    /// coordinator escalates to a fatal pipeline error.
    pub max_consecutive_failures: u32,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./checkpoints"),
            interval_ms: 10_000,
            timeout_ms: 60_000,
            min_pause_ms: 5_000,
            max_concurrent: 1,
            retained: 2,
            cleanup: CleanupPolicy::RetainOnCancel,
            max_consecutive_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    RetainOnCancel,
    DeleteOnCancel,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateConfig {
    pub kind: StateBackendKind,
    /// Storage file for the durable backend. Ignored by the in-memory one.
    pub path: Option<PathBuf>,
    /// Durable backend only persists buckets dirtied since the last snapshot.
    pub incremental: bool,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            kind: StateBackendKind::Memory,
            path: None,
            incremental: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    Memory,
    Durable,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestartConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    pub kind: SinkKind,
    /// Database file for the sqlite sink.
    pub path: Option<PathBuf>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Sqlite,
            path: Some(PathBuf::from("./orders.db")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngressOptions {
    pub bind_addr: String,
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<PipelineConfig> {
    match config_path {
        Some(path) => PipelineConfig::from_file(path),
        None => PipelineConfig::from_env(),
    }
}

impl PipelineConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var("ORDER_INGEST_CONFIG")
            .map_err(|_| anyhow::anyhow!("ORDER_INGEST_CONFIG environment variable not set"))?;
        let config: PipelineConfig = serde_yaml::from_str(&config_str)?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(anyhow::anyhow!("Kafka bootstrap servers cannot be empty"));
        }
        if self.kafka.topic.is_empty() {
            return Err(anyhow::anyhow!("Kafka topic cannot be empty"));
        }
        if self.kafka.consumer_group.is_empty() {
            return Err(anyhow::anyhow!("Kafka consumer group cannot be empty"));
        }
        if self.window.size_seconds == 0 {
            return Err(anyhow::anyhow!("Window size must be at least one second"));
        }
        if self.window.parallelism == 0 {
            return Err(anyhow::anyhow!("Window parallelism must be at least 1"));
        }
        if self.checkpoint.interval_ms == 0 {
            return Err(anyhow::anyhow!("Checkpoint interval must be positive"));
        }
        if self.checkpoint.max_concurrent != 1 {
            return Err(anyhow::anyhow!(
                "At most one checkpoint may be in flight (max_concurrent must be 1)"
            ));
        }
        if self.checkpoint.retained == 0 {
            return Err(anyhow::anyhow!(
                "At least one completed checkpoint must be retained"
            ));
        }
        if self.sink.kind == SinkKind::Sqlite && self.sink.path.is_none() {
            return Err(anyhow::anyhow!("Sqlite sink requires a database path"));
        }
        Ok(())
    }
}
