//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a
//! settings file only needs the keys it changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeraldSettings {
    /// Application name, used in logs.
    pub name: String,
    /// Network and transport settings.
    pub server: ServerSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for HeraldSettings {
    fn default() -> Self {
        Self {
            name: "herald".to_string(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl HeraldSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
    }
}

/// Server network and transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Route for HTTP GraphQL requests.
    pub graphql_path: String,
    /// Route for the WebSocket upgrade.
    pub websocket_path: String,
    /// Whether `GET`/`POST` GraphQL over HTTP is served.
    pub http_enabled: bool,
    /// Keep-alive interval in milliseconds (`0` disables keep-alive).
    pub keep_alive_interval_ms: u64,
    /// Outbound frames buffered per connection before frames are dropped.
    pub send_queue_capacity: usize,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for tasks before giving up, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4000,
            graphql_path: "/graphql".to_string(),
            websocket_path: "/graphql/websocket".to_string(),
            http_enabled: true,
            keep_alive_interval_ms: 12_500,
            send_queue_capacity: 1024,
            max_message_size: 16 * 1024 * 1024,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Routes the server always mounts.
pub const RESERVED_PATHS: [&str; 2] = ["/health", "/metrics"];

impl ServerSettings {
    /// Reject routes that would collide and queue sizes the server cannot
    /// run with.
    pub fn validate(&self) -> Result<()> {
        for (key, path) in [
            ("graphqlPath", &self.graphql_path),
            ("websocketPath", &self.websocket_path),
        ] {
            if !path.starts_with('/') {
                return Err(SettingsError::InvalidValue(format!(
                    "{key} must start with '/'"
                )));
            }
            if RESERVED_PATHS.contains(&path.as_str()) {
                return Err(SettingsError::InvalidValue(format!(
                    "{key} must not be {path}"
                )));
            }
        }
        if self.graphql_path == self.websocket_path {
            return Err(SettingsError::InvalidValue(
                "graphqlPath and websocketPath must differ".to_string(),
            ));
        }
        if self.send_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "sendQueueCapacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Keep-alive interval, `None` when disabled.
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_interval_ms > 0)
            .then(|| Duration::from_millis(self.keep_alive_interval_ms))
    }

    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// `host:port` string for binding.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let settings: HeraldSettings =
            serde_json::from_str(r#"{"server":{"port":9000}}"#).unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(HeraldSettings::default()).unwrap();
        assert_eq!(value["server"]["keepAliveIntervalMs"], 12_500);
        assert_eq!(value["server"]["websocketPath"], "/graphql/websocket");
    }

    #[test]
    fn keep_alive_zero_disables() {
        let mut server = ServerSettings::default();
        assert_eq!(
            server.keep_alive_interval(),
            Some(Duration::from_millis(12_500))
        );
        server.keep_alive_interval_ms = 0;
        assert_eq!(server.keep_alive_interval(), None);
    }

    #[test]
    fn bind_address_formats() {
        let server = ServerSettings::default();
        assert_eq!(server.bind_address(), "127.0.0.1:4000");
    }

    #[test]
    fn validate_rejects_bad_paths() {
        let mut settings = HeraldSettings::default();
        assert!(settings.validate().is_ok());

        settings.server.websocket_path = "ws".to_string();
        assert!(settings.validate().is_err());

        settings.server.websocket_path = "/graphql".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_reserved_routes() {
        let mut server = ServerSettings::default();
        server.graphql_path = "/health".to_string();
        assert!(matches!(
            server.validate(),
            Err(SettingsError::InvalidValue(msg)) if msg.contains("graphqlPath")
        ));

        let mut server = ServerSettings::default();
        server.websocket_path = "/metrics".to_string();
        assert!(server.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_send_queue() {
        let mut settings = HeraldSettings::default();
        settings.server.send_queue_capacity = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }
}
