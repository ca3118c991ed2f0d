//! Delivery of events to the collector.
//!
//! The worker talks to the network only through [`Connector`] and
//! [`Connection`]; [`WebSocketConnector`] is the production implementation.

mod backoff;
mod websocket;
mod worker;

pub use backoff::Backoff;
pub use websocket::WebSocketConnector;
pub use worker::{DrainReport, TransportWorker, WorkerSettings, WorkerState};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::TransportError;
use crate::event::RuntimeInfo;

/// Opens connections to the collector.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live, message-oriented connection.
#[async_trait]
pub trait Connection: Send {
    /// Send one text message.
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Next text message from the collector, `None` once the collector has
    /// closed the connection.
    ///
    /// Must be cancel-safe; the worker polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    /// Close the connection, ignoring errors.
    async fn close(&mut self);
}

/// Envelope for every message the agent sends.
#[derive(Debug, Serialize)]
pub struct OutgoingMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub msg_type: &'static str,
    pub payload: &'a T,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl<'a, T: Serialize> OutgoingMessage<'a, T> {
    pub fn new(msg_type: &'static str, payload: &'a T) -> Self {
        Self {
            msg_type,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Sent once after every successful connect.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    pub api_key: String,
    pub agent_id: String,
    pub hostname: String,
    pub environment: String,
    pub agent_version: &'static str,
    pub runtime: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

impl RegisterPayload {
    pub fn from_config(config: &Config) -> Self {
        let runtime = RuntimeInfo::current();
        Self {
            api_key: config.api_key.clone().unwrap_or_default(),
            agent_id: config.agent_id.clone(),
            hostname: config.hostname.clone(),
            environment: config.environment.clone(),
            agent_version: runtime.agent_version,
            runtime: runtime.runtime,
            platform: runtime.platform,
            arch: runtime.arch,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatPayload {
    pub timestamp: i64,
}

/// Raw message from the collector.
#[derive(Debug, Deserialize)]
struct IncomingMessage {
    #[serde(rename = "type")]
    msg_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Collector messages the worker acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Registered,
    Error { code: String, message: String },
    Other(String),
}

impl ServerMessage {
    /// Parse a collector message; `None` for anything that is not a JSON
    /// envelope.
    pub fn parse(text: &str) -> Option<Self> {
        let incoming: IncomingMessage = serde_json::from_str(text).ok()?;
        let message = match incoming.msg_type.as_str() {
            "registered" => Self::Registered,
            "error" => {
                let field = |name: &str, default: &str| {
                    incoming
                        .payload
                        .get(name)
                        .and_then(|v| v.as_str())
                        .unwrap_or(default)
                        .to_string()
                };
                Self::Error {
                    code: field("code", "unknown"),
                    message: field("message", "Unknown error"),
                }
            }
            other => Self::Other(other.to_string()),
        };
        Some(message)
    }
}
