//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`crate::ResourceClient`] and [`crate::HttpTransport`].
///
/// Every field has a default, so a partial JSON/TOML document (or none at
/// all) deserializes into a usable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API root, e.g. `https://review.example.com/api/v1`.
    pub base_url: String,

    /// Seconds allowed for establishing a connection.
    pub connect_timeout_secs: u64,

    /// Seconds allowed for a whole request, including the body.
    pub timeout_secs: u64,

    /// Capacity of the store's update broadcast channel.
    ///
    /// Slow receivers that fall further behind than this see a lag error
    /// and should re-read the snapshot.
    pub broadcast_capacity: usize,

    /// Policy for re-issuing requests answered with 202.
    pub retry: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            connect_timeout_secs: 10,
            timeout_secs: 30,
            broadcast_capacity: 256,
            retry: RetryConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Exponential backoff for delayed (202) responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Retries before giving up and reporting the response as delayed.
    pub max_delayed_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            max_delay_ms: 1000,
            multiplier: 2.0,
            max_delayed_retries: 25,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"base_url": "https://x.test/api", "retry": {"max_delayed_retries": 3}}"#)
                .unwrap();
        assert_eq!(config.base_url, "https://x.test/api");
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.retry.max_delayed_retries, 3);
        assert_eq!(config.retry.initial_delay(), Duration::from_millis(200));
        assert_eq!(config.retry.max_delay(), Duration::from_millis(1000));
    }
}
