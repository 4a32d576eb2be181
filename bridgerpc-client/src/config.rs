//! Client configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via BRIDGERPC_CONFIG)
//! 3. Environment variables

use bridgerpc_protocol::MAX_PAYLOAD_SIZE;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Framing and call behaviour.
    pub transport: TransportConfig,
    /// Reconnect policy for channels that can drop.
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("BRIDGERPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: ClientConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.transport.apply_env_overrides();
        self.reconnect.apply_env_overrides();
    }

    /// Validates the whole configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transport.validate()?;
        self.reconnect.validate()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.transport.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_queue_until_connected(mut self, queue: bool) -> Self {
        self.transport.queue_until_connected = queue;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Framing and call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest accepted frame payload in bytes.
    pub max_payload_bytes: u64,
    /// Per-call timeout in milliseconds (0 = no timeout).
    pub request_timeout_ms: u64,
    /// Hold calls made while disconnected and send them on the next connect.
    pub queue_until_connected: bool,
    /// Interval of the pending-call timeout sweep in milliseconds.
    pub sweep_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: MAX_PAYLOAD_SIZE,
            request_timeout_ms: 0,
            queue_until_connected: false,
            sweep_interval_ms: 1000,
        }
    }
}

impl TransportConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("BRIDGERPC_MAX_PAYLOAD") {
            if let Ok(n) = max.parse() {
                self.max_payload_bytes = n;
            }
        }

        if let Ok(timeout) = std::env::var("BRIDGERPC_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Ok(queue) = std::env::var("BRIDGERPC_QUEUE_UNTIL_CONNECTED") {
            self.queue_until_connected = queue == "1" || queue.to_lowercase() == "true";
        }
    }

    /// Returns the request timeout, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Returns how often pending calls are checked for expiry.
    pub fn sweep_interval(&self) -> Duration {
        let interval = Duration::from_millis(self.sweep_interval_ms.max(1));
        match self.request_timeout() {
            Some(timeout) => interval.min(timeout),
            None => interval,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "max_payload_bytes must be greater than zero".to_string(),
            ));
        }
        if self.max_payload_bytes > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "max_payload_bytes {} exceeds protocol limit {}",
                self.max_payload_bytes, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(())
    }
}

/// Reconnect policy: capped exponential backoff with jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after a failure or channel loss.
    pub enabled: bool,
    /// Delay before the first retry in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any retry delay in milliseconds.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive retries.
    pub multiplier: f64,
    /// Randomize each delay between half and all of its nominal value.
    pub jitter: bool,
    /// Give up after this many consecutive failed attempts (None = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_backoff_ms: 250,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ms) = std::env::var("BRIDGERPC_RECONNECT_INITIAL_MS") {
            if let Ok(n) = ms.parse() {
                self.initial_backoff_ms = n;
            }
        }

        if let Ok(ms) = std::env::var("BRIDGERPC_RECONNECT_MAX_MS") {
            if let Ok(n) = ms.parse() {
                self.max_backoff_ms = n;
            }
        }

        if let Ok(m) = std::env::var("BRIDGERPC_RECONNECT_MULTIPLIER") {
            if let Ok(f) = m.parse() {
                self.multiplier = f;
            }
        }

        if let Ok(jitter) = std::env::var("BRIDGERPC_RECONNECT_JITTER") {
            self.jitter = jitter == "1" || jitter.to_lowercase() == "true";
        }
    }

    /// Nominal (unjittered) delay before retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(64) as i32);
        let ms = (self.initial_backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Delay before retry number `attempt`, with jitter applied if enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        if !self.jitter || base < 2 {
            return Duration::from_millis(base);
        }
        let half = base / 2;
        let jittered = half + rand::rng().random_range(0..=base - half);
        Duration::from_millis(jittered)
    }

    /// Returns whether another retry is allowed after `failures` attempts.
    pub fn allows_attempt(&self, failures: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| failures < max)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(format!(
                "reconnect multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "initial_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.transport.max_payload_bytes, MAX_PAYLOAD_SIZE);
        assert!(config.transport.request_timeout().is_none());
        assert!(!config.transport.queue_until_connected);
        assert!(config.reconnect.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = ReconnectConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
            jitter: false,
            ..Default::default()
        };

        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(40), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = ReconnectConfig {
            initial_backoff_ms: 400,
            max_backoff_ms: 400,
            jitter: true,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(200), "{:?}", delay);
            assert!(delay <= Duration::from_millis(400), "{:?}", delay);
        }
    }

    #[test]
    fn test_max_attempts() {
        let policy = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(policy.allows_attempt(0));
        assert!(policy.allows_attempt(1));
        assert!(!policy.allows_attempt(2));

        let disabled = ReconnectConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!disabled.allows_attempt(0));
    }

    #[test]
    fn test_sweep_interval_bounded_by_timeout() {
        let config = ClientConfig::default().with_request_timeout(Duration::from_millis(200));
        assert_eq!(
            config.transport.sweep_interval(),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = ClientConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = ClientConfig::default();
        config.transport.max_payload_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "transport:\n  request_timeout_ms: 5000\n  queue_until_connected: true\nreconnect:\n  initial_backoff_ms: 10\n  max_attempts: 3"
        )
        .unwrap();

        let config = ClientConfig::from_file(file.path()).unwrap();
        assert_eq!(
            config.transport.request_timeout(),
            Some(Duration::from_millis(5000))
        );
        assert!(config.transport.queue_until_connected);
        assert_eq!(config.reconnect.initial_backoff_ms, 10);
        assert_eq!(config.reconnect.max_attempts, Some(3));
        // Unspecified fields keep their defaults.
        assert_eq!(config.reconnect.max_backoff_ms, 30_000);
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = ClientConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ClientConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            parsed.reconnect.initial_backoff_ms,
            config.reconnect.initial_backoff_ms
        );
    }
}
