//! Configuration.
//!
//! Every section has defaults, so an empty file is a valid config.
//!
//! ```toml
//! [runtime]
//! max_flush_rounds = 100
//!
//! [server]
//! bind = "127.0.0.1:9400"
//! outbound_queue_capacity = 256
//!
//! [client]
//! url = "ws://127.0.0.1:9400"
//! offline_queue_capacity = 64
//!
//! [[keys]]
//! name = "counter"
//! initial = 0
//! validator = "non-negative"
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub keys: Vec<KeyConfig>,
}

impl Config {
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }
}

/// Reactive runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flush rounds allowed before the scheduler gives up on effects that
    /// keep re-triggering each other.
    pub max_flush_rounds: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_flush_rounds: 100,
        }
    }
}

/// Authoritative side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,

    /// Envelopes queued per connection before updates are dropped in favour
    /// of a full resync.
    pub outbound_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9400)),
            outbound_queue_capacity: 256,
        }
    }
}

/// Remote side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,

    /// Local writes held per channel while disconnected or while a proposal
    /// is in flight.
    pub offline_queue_capacity: usize,

    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
}

impl ClientConfig {
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms.max(self.reconnect_initial_delay_ms))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9400".to_string(),
            offline_queue_capacity: 64,
            reconnect_initial_delay_ms: 100,
            reconnect_max_delay_ms: 5_000,
        }
    }
}

/// A shared-state key served by the standalone server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub name: String,

    #[serde(default)]
    pub initial: Value,

    #[serde(default)]
    pub validator: ValidatorKind,
}

/// Built-in validators selectable from a config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValidatorKind {
    #[default]
    Any,
    Number,
    NonNegative,
    String,
    Bool,
}

impl ValidatorKind {
    pub fn validate(self, value: &Value) -> bool {
        match self {
            ValidatorKind::Any => true,
            ValidatorKind::Number => value.is_number(),
            ValidatorKind::NonNegative => value.as_f64().is_some_and(|n| n >= 0.0),
            ValidatorKind::String => value.is_string(),
            ValidatorKind::Bool => value.is_boolean(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.runtime.max_flush_rounds, 100);
        assert_eq!(config.server.outbound_queue_capacity, 256);
        assert_eq!(config.client.offline_queue_capacity, 64);
    }

    #[test]
    fn parses_sections_and_keys() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind = "0.0.0.0:7000"
            outbound_queue_capacity = 8

            [client]
            reconnect_initial_delay_ms = 50

            [[keys]]
            name = "counter"
            initial = 0
            validator = "non-negative"

            [[keys]]
            name = "profile"
            initial = { name = "ada", tags = ["x"] }
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.server.outbound_queue_capacity, 8);
        assert_eq!(config.client.reconnect_initial_delay(), Duration::from_millis(50));
        assert_eq!(config.client.url, "ws://127.0.0.1:9400");

        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].initial, json!(0));
        assert_eq!(config.keys[0].validator, ValidatorKind::NonNegative);
        assert_eq!(config.keys[1].initial, json!({"name": "ada", "tags": ["x"]}));
        assert_eq!(config.keys[1].validator, ValidatorKind::Any);
    }

    #[test]
    fn unknown_validator_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            [[keys]]
            name = "x"
            validator = "prime"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn builtin_validators() {
        assert!(ValidatorKind::Any.validate(&json!(null)));
        assert!(ValidatorKind::Number.validate(&json!(1.5)));
        assert!(!ValidatorKind::Number.validate(&json!("1")));
        assert!(ValidatorKind::NonNegative.validate(&json!(0)));
        assert!(!ValidatorKind::NonNegative.validate(&json!(-1)));
        assert!(ValidatorKind::String.validate(&json!("s")));
        assert!(ValidatorKind::Bool.validate(&json!(false)));
    }
}
