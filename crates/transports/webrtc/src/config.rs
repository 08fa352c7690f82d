//! Configuration types for stream orchestration

use crate::stream::StreamIdentity;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration for the Orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Gateway WebSocket signaling URL (ws:// or wss://)
    pub gateway_url: String,

    /// STUN server URLs
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Negotiate an audio transceiver in addition to video (default: false)
    pub receive_audio: bool,

    /// Query parameter carrying the stream key (default: "src")
    pub stream_param: String,

    /// Query parameter carrying the credential (default: "token")
    pub token_param: String,

    /// Per-stream retry and timing policy
    pub connection: ConnectionPolicy,

    /// Admission policy across streams
    pub scheduler: SchedulerConfig,

    /// Streams in configured order
    pub streams: Vec<StreamConfig>,
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// One configured camera stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Unique stream key, as known to the gateway
    pub key: String,

    /// Human readable label
    #[serde(default)]
    pub label: String,

    /// Layout hint, passed through untouched
    #[serde(default)]
    pub size_hint: SizeHint,

    /// Higher priority streams are enabled first (default: 0)
    #[serde(default)]
    pub priority: i32,
}

/// Layout size hint for a stream tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeHint {
    /// Small tile
    Small,
    /// Medium tile (default)
    #[default]
    Medium,
    /// Large tile
    Large,
}

impl StreamConfig {
    /// Create a stream record with default size hint and priority
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            size_hint: SizeHint::default(),
            priority: 0,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Immutable identity of this stream
    pub fn identity(&self) -> StreamIdentity {
        let label = if self.label.is_empty() {
            self.key.clone()
        } else {
            self.label.clone()
        };
        StreamIdentity::new(self.key.clone(), label)
    }
}

/// Per-stream retry policy and timing constants
///
/// Controls how a stream connection retries after failures, and how long it
/// tolerates transient conditions before acting on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPolicy {
    /// Attempts before a stream is reported Failed (default: 3)
    pub max_attempts: u32,

    /// Initial backoff delay in milliseconds (default: 2000ms)
    pub base_delay_ms: u64,

    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub max_backoff_ms: u64,

    /// Delay before reconnecting a stream that has been connected before (default: 500ms)
    pub fast_reconnect_delay_ms: u64,

    /// How long a `disconnected` peer state may persist before it counts as a failure (default: 2000ms)
    pub disconnect_grace_ms: u64,

    /// Signaling channel connect timeout in milliseconds (default: 5000ms)
    pub connect_timeout_ms: u64,

    /// How long an attempt may stay in Connecting before it times out (default: 15000ms)
    pub attempt_timeout_ms: u64,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_backoff_ms: 30000,
            fast_reconnect_delay_ms: 500,
            disconnect_grace_ms: 2000,
            connect_timeout_ms: 5000,
            attempt_timeout_ms: 15000,
        }
    }
}

impl ConnectionPolicy {
    /// Calculate the delay before the next attempt
    ///
    /// Streams that have never connected back off exponentially from
    /// `base_delay_ms` (doubling per attempt, clamped to `max_backoff_ms`).
    /// Streams that reached Connected at least once use the short
    /// `fast_reconnect_delay_ms`.
    ///
    /// # Arguments
    /// * `attempt` - Number of the attempt that just failed (1-indexed)
    /// * `ever_connected` - Whether the stream has been connected before
    pub fn backoff_delay(&self, attempt: u32, ever_connected: bool) -> Duration {
        if ever_connected {
            return Duration::from_millis(self.fast_reconnect_delay_ms);
        }

        let exponent = attempt.saturating_sub(1).min(31);
        let backoff_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);

        Duration::from_millis(backoff_ms)
    }

    /// Check if another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Grace period for `disconnected`
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Signaling connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Attempt timeout
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

/// Admission mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Bounded-concurrency pool with a FIFO wait queue
    #[default]
    Capped,
    /// Strict one-at-a-time waterfall in configured order
    Gated,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Admission mode (default: capped)
    pub mode: SchedulerMode,

    /// Slots available in capped mode (default: 4)
    pub max_concurrent: usize,

    /// Spacing between consecutive admissions in capped mode (default: 100ms)
    pub admission_spacing_ms: u64,

    /// Settling delay after a slot is released before the queue is served (default: 400ms)
    pub release_settle_ms: u64,

    /// Optional bound on queued requests in capped mode (default: unbounded)
    pub max_queue_depth: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: SchedulerMode::Capped,
            max_concurrent: 4,
            admission_spacing_ms: 100,
            release_settle_ms: 400,
            max_queue_depth: None,
        }
    }
}

impl SchedulerConfig {
    /// Spacing between admissions
    pub fn admission_spacing(&self) -> Duration {
        Duration::from_millis(self.admission_spacing_ms)
    }

    /// Settling delay after a release
    pub fn release_settle(&self) -> Duration {
        Duration::from_millis(self.release_settle_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:1984/api/ws".to_string(),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: Vec::new(),
            receive_audio: false,
            stream_param: "src".to_string(),
            token_param: "token".to_string(),
            connection: ConnectionPolicy::default(),
            scheduler: SchedulerConfig::default(),
            streams: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML, TOML or JSON file
    ///
    /// The format is chosen by file extension (`.yaml`/`.yml`, `.toml`,
    /// `.json`). Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&raw),
            "toml" => Self::from_toml_str(&raw),
            "json" => serde_json::from_str(&raw).map_err(|e| {
                Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
            }),
            other => Err(Error::InvalidConfig(format!(
                "Unsupported config format '{}' for {}",
                other,
                path.display()
            ))),
        }
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse YAML config: {}", e)))
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse TOML config: {}", e)))
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `gateway_url` is not a WebSocket URL
    /// - `connection.max_attempts` or `connection.base_delay_ms` is zero
    /// - `scheduler.max_concurrent` is zero in capped mode
    /// - `scheduler.max_queue_depth` is `Some(0)`
    /// - a stream key is empty or duplicated
    pub fn validate(&self) -> Result<()> {
        if !self.gateway_url.starts_with("ws://") && !self.gateway_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "gateway_url must start with ws:// or wss://, got {}",
                self.gateway_url
            )));
        }

        if self.stream_param.is_empty() || self.token_param.is_empty() {
            return Err(Error::InvalidConfig(
                "stream_param and token_param must not be empty".to_string(),
            ));
        }

        if self.connection.max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "connection.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.connection.base_delay_ms == 0 {
            return Err(Error::InvalidConfig(
                "connection.base_delay_ms must be greater than 0".to_string(),
            ));
        }

        if self.connection.max_backoff_ms < self.connection.base_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "connection.max_backoff_ms ({}) must not be below base_delay_ms ({})",
                self.connection.max_backoff_ms, self.connection.base_delay_ms
            )));
        }

        if self.scheduler.mode == SchedulerMode::Capped && self.scheduler.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "scheduler.max_concurrent must be at least 1 in capped mode".to_string(),
            ));
        }

        if self.scheduler.max_queue_depth == Some(0) {
            return Err(Error::InvalidConfig(
                "scheduler.max_queue_depth must be at least 1 when set".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.key.trim().is_empty() {
                return Err(Error::InvalidConfig("stream key must not be empty".to_string()));
            }
            if !seen.insert(stream.key.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate stream key: {}",
                    stream.key
                )));
            }
        }

        Ok(())
    }

    /// Streams in enable order
    ///
    /// Configured order, stably sorted by descending priority.
    pub fn ordered_streams(&self) -> Vec<StreamConfig> {
        let mut streams = self.streams.clone();
        streams.sort_by(|a, b| b.priority.cmp(&a.priority));
        streams
    }

    /// Create a configuration preset for a strict one-at-a-time waterfall
    ///
    /// # Example
    ///
    /// ```
    /// use camgrid_webrtc::config::{OrchestratorConfig, SchedulerMode};
    ///
    /// let config = OrchestratorConfig::gated_preset("ws://nvr.local:1984/api/ws");
    /// assert_eq!(config.scheduler.mode, SchedulerMode::Gated);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn gated_preset(gateway_url: &str) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            scheduler: SchedulerConfig {
                mode: SchedulerMode::Gated,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration preset for a bounded pool of `max_concurrent` slots
    pub fn capped_preset(gateway_url: &str, max_concurrent: usize) -> Self {
        Self {
            gateway_url: gateway_url.to_string(),
            scheduler: SchedulerConfig {
                mode: SchedulerMode::Capped,
                max_concurrent,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
