//! Wire frames exchanged between host and worker.
//!
//! Inbound (host → worker): `{ "id", "name", "data" }`.
//! Outbound (worker → host): responses `{ "id", "name": "respond_resolve" | "respond_reject", "data" }`
//! and notifications `{ "name": "error" | "console", "data" }` without an id.

use crate::errors::ErrorRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id chosen by the host; unique per request for the lifetime of the channel.
pub type CorrelationId = String;

/// Request frame sent by the host: one handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: CorrelationId,
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl InboundMessage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            data,
        }
    }
}

/// Value of the `name` field on outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameName {
    RespondResolve,
    RespondReject,
    Error,
    Console,
}

impl FrameName {
    /// True for the two terminal response kinds (frames that carry an id).
    pub fn is_response(self) -> bool {
        matches!(self, FrameName::RespondResolve | FrameName::RespondReject)
    }
}

/// Frame sent by the worker: either a correlated response or an uncorrelated notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CorrelationId>,
    pub name: FrameName,
    #[serde(default)]
    pub data: Value,
}

impl OutboundFrame {
    pub fn resolve(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            name: FrameName::RespondResolve,
            data,
        }
    }

    pub fn reject(id: impl Into<String>, error: &ErrorRecord) -> Self {
        Self {
            id: Some(id.into()),
            name: FrameName::RespondReject,
            data: error.to_value(),
        }
    }

    pub fn error(data: Value) -> Self {
        Self {
            id: None,
            name: FrameName::Error,
            data,
        }
    }

    pub fn console(payload: &ConsolePayload) -> Self {
        Self {
            id: None,
            name: FrameName::Console,
            data: serde_json::json!({
                "level": payload.level.as_str(),
                "args": payload.args,
            }),
        }
    }
}

/// Console level as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Info,
    Dir,
    Warn,
    Log,
    Error,
}

impl ConsoleLevel {
    pub const ALL: [ConsoleLevel; 5] = [
        ConsoleLevel::Info,
        ConsoleLevel::Dir,
        ConsoleLevel::Warn,
        ConsoleLevel::Log,
        ConsoleLevel::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleLevel::Info => "info",
            ConsoleLevel::Dir => "dir",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Log => "log",
            ConsoleLevel::Error => "error",
        }
    }
}

impl From<log::Level> for ConsoleLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Error => ConsoleLevel::Error,
            log::Level::Warn => ConsoleLevel::Warn,
            log::Level::Info => ConsoleLevel::Info,
            log::Level::Debug => ConsoleLevel::Log,
            log::Level::Trace => ConsoleLevel::Dir,
        }
    }
}

impl std::fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `console` notification. `args` is an array, or a string once degraded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolePayload {
    pub level: ConsoleLevel,
    #[serde(default)]
    pub args: Value,
}

impl ConsolePayload {
    /// True when `args` was reduced to its string form because the structured form could not be sent.
    pub fn is_degraded(&self) -> bool {
        self.args.is_string()
    }
}
