use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Top-level configuration, deserializable from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    pub network: NetworkConfig,
    pub queue: QueueConfig,
    pub derived: DerivedConfig,
}

/// Retry pacing for failed requests.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Lower bound of the randomized first wait.
    pub min_retry_wait_ms: u64,
    /// Upper bound of the randomized first wait.
    pub max_random_retry_wait_ms: u64,
    /// Cap applied after each doubling.
    pub max_retry_wait_ms: u64,
    /// Number of `sleep()` calls that resolve before the throttle rejects.
    pub max_request_retries: u32,
}

/// Store keys used by the sequential queue.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub persisted_requests_key: String,
    pub time_skew_key: String,
}

/// Derived value engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DerivedConfig {
    /// Bound on cascaded recomputation rounds (derived values feeding other
    /// derived values) within one processing pass.
    pub max_propagation_rounds: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            min_retry_wait_ms: 10,
            max_random_retry_wait_ms: 100,
            max_retry_wait_ms: 10_000,
            max_request_retries: 10,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            persisted_requests_key: "persistedRequests".to_string(),
            time_skew_key: "network_timeSkew".to_string(),
        }
    }
}

impl Default for DerivedConfig {
    fn default() -> Self {
        Self {
            max_propagation_rounds: 16,
        }
    }
}

impl TallyConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: TallyConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        if net.min_retry_wait_ms > net.max_random_retry_wait_ms {
            return Err(ConfigError::InvalidValue(format!(
                "network.min_retry_wait_ms ({}) exceeds network.max_random_retry_wait_ms ({})",
                net.min_retry_wait_ms, net.max_random_retry_wait_ms
            )));
        }
        if net.max_random_retry_wait_ms > net.max_retry_wait_ms {
            return Err(ConfigError::InvalidValue(format!(
                "network.max_random_retry_wait_ms ({}) exceeds network.max_retry_wait_ms ({})",
                net.max_random_retry_wait_ms, net.max_retry_wait_ms
            )));
        }
        if net.max_retry_wait_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "network.max_retry_wait_ms must be > 0".to_string(),
            ));
        }
        if self.derived.max_propagation_rounds == 0 {
            return Err(ConfigError::InvalidValue(
                "derived.max_propagation_rounds must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
