//! Error types for the faultline agent.
//!
//! Only `init` surfaces errors to the host application. Everything on the
//! capture and delivery path is absorbed internally: transport failures are
//! handled by the worker, overflow is counted, bad context values are replaced
//! with placeholders.

use thiserror::Error;

/// Error type for agent lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration is missing a required value or holds an invalid one.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Failed to start the background transport runtime.
    #[error("failed to start transport runtime: {0}")]
    Runtime(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("missing API key: set FAULTLINE_API_KEY or Config::api_key")]
    MissingApiKey,

    #[error("invalid backend URL '{url}': {message}")]
    InvalidBackendUrl { url: String, message: String },

    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },

    #[error("sampling rate must be a number, got {0}")]
    InvalidSamplingRate(f64),
}

/// Errors raised inside the transport worker.
///
/// These never leave the worker; they drive the reconnect state machine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },

    #[error("send failed: {0}")]
    Send(String),

    #[error("connection closed by collector")]
    Closed,

    #[error("collector rejected the agent ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the collector refused our credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if code == "auth_error" || code == "invalid_api_key")
    }
}

/// Result type alias for faultline operations.
pub type Result<T> = std::result::Result<T, Error>;
