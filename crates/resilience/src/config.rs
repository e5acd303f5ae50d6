//! Per-platform configuration
//!
//! Retry limits, backoff bounds and circuit breaker tuning are looked up per
//! courier platform through a [`ConfigSource`]. The bundled
//! [`StaticConfigSource`] serves a fixed map, optionally loaded from JSON:
//!
//! ```text
//! {
//!   "default": { "max_retries": 5 },
//!   "platforms": {
//!     "swiftship": { "max_retries": 3, "base_delay": 2000,
//!                    "circuit_breaker": { "failure_threshold": 10 } }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::reliability::CircuitBreakerConfig;

/// Error type for configuration lookups
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No configuration exists for the platform and no fallback is set
    #[error("no configuration for platform: {0}")]
    UnknownPlatform(String),

    /// Configuration file could not be read
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Retry and circuit breaker settings for one platform
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlatformConfig {
    /// Automatic retries allowed before a job is dead-lettered
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Upper bound on any single retry delay
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,

    /// Fraction of the delay added as uniform random jitter
    pub jitter_factor: f64,

    /// Circuit breaker tuning
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl PlatformConfig {
    /// Create a platform configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of automatic retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base backoff delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum backoff delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter_factor(mut self, jitter: f64) -> Self {
        self.jitter_factor = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set the circuit breaker configuration
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }
}

/// Provider of per-platform configuration
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Configuration for `platform`
    ///
    /// Returns [`ConfigError::UnknownPlatform`] when the platform is not
    /// configured. Callers treat that as a contract violation.
    async fn platform_config(&self, platform: &str) -> Result<PlatformConfig, ConfigError>;

    /// Platforms with explicit configuration
    async fn platforms(&self) -> Vec<String> {
        vec![]
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    default: Option<PlatformConfig>,
    #[serde(default)]
    platforms: HashMap<String, PlatformConfig>,
}

/// Fixed configuration map with an optional fallback entry
///
/// # Example
///
/// ```
/// use dispatch_resilience::config::{PlatformConfig, StaticConfigSource};
///
/// let source = StaticConfigSource::new()
///     .with_platform("swiftship", PlatformConfig::default().with_max_retries(3))
///     .with_fallback(PlatformConfig::default());
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticConfigSource {
    platforms: HashMap<String, PlatformConfig>,
    fallback: Option<PlatformConfig>,
}

impl StaticConfigSource {
    /// Create an empty source; every lookup fails until platforms are added
    pub fn new() -> Self {
        Self::default()
    }

    /// Source that answers every platform with the same configuration
    pub fn uniform(config: PlatformConfig) -> Self {
        Self::new().with_fallback(config)
    }

    /// Add or replace a platform entry
    pub fn with_platform(mut self, platform: impl Into<String>, config: PlatformConfig) -> Self {
        self.platforms.insert(platform.into(), config);
        self
    }

    /// Configuration served for platforms without an explicit entry
    pub fn with_fallback(mut self, config: PlatformConfig) -> Self {
        self.fallback = Some(config);
        self
    }

    /// Parse a JSON document (see module docs for the layout)
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        Ok(Self {
            platforms: file.platforms,
            fallback: file.default,
        })
    }

    /// Load a JSON document from disk
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Look up a platform synchronously
    pub fn get(&self, platform: &str) -> Result<PlatformConfig, ConfigError> {
        self.platforms
            .get(platform)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| ConfigError::UnknownPlatform(platform.to_string()))
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn platform_config(&self, platform: &str) -> Result<PlatformConfig, ConfigError> {
        self.get(platform)
    }

    async fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.platforms.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
