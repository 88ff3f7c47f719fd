//! Client configuration.
//!
//! Every field has a default, so a config document only names what it
//! changes:
//!
//! ```json
//! { "max_connections": 4, "mode": "blocking" }
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::transport::TransportMode;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Pool size per host.
    pub max_connections: usize,
    /// Default per-request timeout.
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Outcomes kept in the rolling health window.
    pub health_window: usize,
    pub mode: TransportMode,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            request_timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            health_window: 100,
            mode: TransportMode::Evented,
        }
    }
}

impl ClientConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_defaults() {
        assert_eq!(ClientConfig::from_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config =
            ClientConfig::from_json(r#"{"max_connections": 2, "mode": "blocking"}"#).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.mode, TransportMode::Blocking);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_unknown_mode_and_fields() {
        assert!(ClientConfig::from_json(r#"{"mode": "async"}"#).is_err());
        assert!(ClientConfig::from_json(r#"{"pool": 3}"#).is_err());
    }
}
