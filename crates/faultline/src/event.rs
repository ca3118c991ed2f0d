//! Captured event model.

use serde::Serialize;

use crate::context::{ContextMap, UserIdentity};

/// What produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// An uncaught panic intercepted by the panic hook.
    Fault,
    /// An error handed to `capture_error`.
    ReportedError,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fault => write!(f, "fault"),
            Self::ReportedError => write!(f, "reported_error"),
        }
    }
}

/// A single resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    /// Function name without its module path.
    pub function: String,

    /// Module path of the function (`crate::module`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,

    /// False for frames from the toolchain or registry dependencies.
    pub in_app: bool,
}

/// Runtime the agent is running in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeInfo {
    pub runtime: &'static str,
    pub agent_version: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

impl RuntimeInfo {
    pub fn current() -> Self {
        Self {
            runtime: "rust",
            agent_version: env!("CARGO_PKG_VERSION"),
            platform: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }
}

/// One bounded capture record, ready for transmission.
///
/// Built by [`EventBuilder`](crate::builder::EventBuilder); every string,
/// collection and nesting level has already been truncated to the configured
/// limits.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: String,
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,
    pub kind: EventKind,
    pub exception_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cause_chain: Vec<String>,
    /// Innermost frame first.
    pub stack_frames: Vec<StackFrame>,
    /// Panic location as `file:line:col`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub fingerprint: String,
    pub context: ContextMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserIdentity>,
    pub environment: String,
    pub agent_id: String,
    pub hostname: String,
    pub runtime: RuntimeInfo,
    /// Set when any field was cut to fit the configured limits.
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(serde_json::to_string(&EventKind::Fault).unwrap(), "\"fault\"");
        assert_eq!(
            serde_json::to_string(&EventKind::ReportedError).unwrap(),
            "\"reported_error\""
        );
        assert_eq!(EventKind::ReportedError.to_string(), "reported_error");
    }

    #[test]
    fn test_frame_omits_missing_fields() {
        let frame = StackFrame {
            function: "handler".to_string(),
            module: None,
            file: None,
            line: Some(12),
            column: None,
            in_app: true,
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"function":"handler","line":12,"in_app":true}"#);
    }
}
