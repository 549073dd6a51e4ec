//! Connectivity Configuration
//!
//! Tunables for probing, caching, selection, backoff and the connectivity
//! channel. Every field has a default, so a config file only needs to name
//! the values it overrides.
//!
//! ```toml
//! [backoff]
//! factor = 1.5
//! max_delay_ms = 60000
//!
//! [monitor]
//! scheme = "ws"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete control-plane configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    /// Endpoint latency probe
    pub probe: ProbeConfig,
    /// Location cache
    pub registry: RegistryConfig,
    /// Default location choice
    pub selector: SelectorConfig,
    /// Reconnect backoff and escalation
    pub backoff: BackoffConfig,
    /// Connectivity channel
    pub monitor: MonitorConfig,
}

/// Latency probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Sequential requests per probe
    pub samples: u32,
    /// Timeout for a single request (ms)
    pub request_timeout_ms: u64,
    /// Process-wide cap on probes in flight
    pub max_in_flight: usize,
    /// URL scheme used for the probe request
    pub scheme: String,
    /// Prefix prepended to the endpoint domain
    pub host_prefix: String,
    /// Health path requested on the probe host
    pub path: String,
    /// User-Agent header
    pub user_agent: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            samples: 3,
            request_timeout_ms: 3_000,
            max_in_flight: 10,
            scheme: "https".to_string(),
            host_prefix: "ping.".to_string(),
            path: "/".to_string(),
            user_agent: format!("vpnlink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ProbeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Build the probe URL for an endpoint host
    pub fn url_for(&self, host: &str) -> String {
        format!("{}://{}{}{}", self.scheme, self.host_prefix, host, self.path)
    }
}

/// Location cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Age after which a measured ping is re-probed (seconds)
    pub ping_ttl_secs: u64,
    /// Period of the background re-ping pass (seconds)
    pub refresh_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ping_ttl_secs: 10 * 60,
            refresh_interval_secs: 5 * 60,
        }
    }
}

impl RegistryConfig {
    pub fn ping_ttl(&self) -> Duration {
        Duration::from_secs(self.ping_ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

/// Default location selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    /// One-off wait for in-progress measurements before picking (ms)
    pub measurement_wait_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            measurement_wait_ms: 1_000,
        }
    }
}

impl SelectorConfig {
    pub fn measurement_wait(&self) -> Duration {
        Duration::from_millis(self.measurement_wait_ms)
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay (ms)
    pub initial_delay_ms: u64,
    /// Upper bound for the retry delay (ms)
    pub max_delay_ms: u64,
    /// Growth factor applied after every scheduled retry
    pub factor: f64,
    /// Accumulated retry time after which a full re-selection is forced (ms)
    pub escalation_threshold_ms: u64,
    /// Failed attempts are padded to at least this duration (ms)
    pub min_attempt_duration_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 3 * 60 * 1_000,
            factor: 1.3,
            escalation_threshold_ms: 70_000,
            min_attempt_duration_ms: 1_000,
        }
    }
}

impl BackoffConfig {
    /// Delay that follows `current` in the backoff sequence
    pub fn next_delay_ms(&self, current: u64) -> u64 {
        let grown = (current as f64 * self.factor).round() as u64;
        grown.max(current).min(self.max_delay_ms)
    }

    pub fn min_attempt_duration(&self) -> Duration {
        Duration::from_millis(self.min_attempt_duration_ms)
    }
}

/// Connectivity channel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// WebSocket scheme (`wss` in production)
    pub scheme: String,
    /// Path of the channel on the control-plane host
    pub path: String,
    /// Period between ping rounds (seconds)
    pub ping_interval_secs: u64,
    /// Ping exchanges per round
    pub ping_samples: u32,
    /// Timeout for one ping exchange (ms)
    pub ping_timeout_ms: u64,
    /// Timeout for the WebSocket handshake (ms)
    pub connect_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            path: "/user".to_string(),
            ping_interval_secs: 60,
            ping_samples: 3,
            ping_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl MonitorConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl ConnectivityConfig {
    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.samples == 0 || self.monitor.ping_samples == 0 {
            return Err(ConfigError::Invalid("sample count must be at least 1".into()));
        }
        if self.probe.max_in_flight == 0 {
            return Err(ConfigError::Invalid("probe concurrency must be at least 1".into()));
        }
        if self.probe.request_timeout_ms == 0
            || self.monitor.ping_timeout_ms == 0
            || self.monitor.connect_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.monitor.ping_interval_secs == 0 {
            return Err(ConfigError::Invalid("ping interval must be non-zero".into()));
        }
        if !(self.backoff.factor >= 1.0) {
            return Err(ConfigError::Invalid("backoff factor must be >= 1".into()));
        }
        if self.backoff.initial_delay_ms == 0
            || self.backoff.initial_delay_ms > self.backoff.max_delay_ms
        {
            return Err(ConfigError::Invalid(
                "backoff floor must be non-zero and not above the cap".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format")]
    UnsupportedFormat,

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
