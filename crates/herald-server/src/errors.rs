//! Server startup errors.
//!
//! Once running, nothing in the server fails outward: routing misses are
//! dropped and execution failures become error payloads.

use thiserror::Error;

/// Errors raised while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Could not bind or inspect the listening socket.
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    /// Could not install the Prometheus recorder.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    /// Invalid configuration.
    #[error(transparent)]
    Settings(#[from] herald_settings::SettingsError),
}
