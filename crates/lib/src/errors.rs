//! Error records that cross the channel.
//!
//! Rust errors are not transportable as-is, so every failure that reaches the host is
//! normalized into an [`ErrorRecord`]: `{ "message", "stack", ...fields }`. Only fields
//! attached through [`HandlerError::with_field`] are copied; `message` and `stack` are
//! reserved and always come from the error itself.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;

const RESERVED_FIELDS: [&str; 2] = ["message", "stack"];

/// Serializable error as sent in `respond_reject` and `error` frames.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default)]
    pub stack: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: String::new(),
            fields: Map::new(),
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = stack.into();
        self
    }

    /// Normalize any error. Message is the top-level display; stack is the cause chain and
    /// backtrace (when captured); fields are collected from every [`HandlerError`] in the chain.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let mut fields = Map::new();
        for cause in err.chain() {
            if let Some(handler_err) = cause.downcast_ref::<HandlerError>() {
                for (k, v) in &handler_err.fields {
                    fields.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        }
        Self {
            message: err.to_string(),
            stack: format!("{:?}", err),
            fields,
        }
    }

    /// Record for a caught panic payload. `stack` is whatever the panic hook captured, if anything.
    pub fn from_panic(payload: &(dyn Any + Send), stack: Option<String>) -> Self {
        Self {
            message: panic_message(payload),
            stack: stack.unwrap_or_default(),
            fields: Map::new(),
        }
    }

    /// Lenient decode of a record received from the other side. Objects keep their fields;
    /// strings become the message; anything else is stringified.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new(message),
            Value::Object(mut obj) => {
                let message = match obj.remove("message") {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let stack = match obj.remove("stack") {
                    Some(Value::String(s)) => s,
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Self {
                    message,
                    stack,
                    fields: obj,
                }
            }
            other => Self::new(other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        for (k, v) in &self.fields {
            if !RESERVED_FIELDS.contains(&k.as_str()) {
                obj.insert(k.clone(), v.clone());
            }
        }
        obj.insert("message".to_string(), Value::String(self.message.clone()));
        obj.insert("stack".to_string(), Value::String(self.stack.clone()));
        Value::Object(obj)
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<anyhow::Error> for ErrorRecord {
    fn from(err: anyhow::Error) -> Self {
        ErrorRecord::from_anyhow(&err)
    }
}

impl From<&anyhow::Error> for ErrorRecord {
    fn from(err: &anyhow::Error) -> Self {
        ErrorRecord::from_anyhow(err)
    }
}

impl From<HandlerError> for ErrorRecord {
    fn from(err: HandlerError) -> Self {
        ErrorRecord::from_anyhow(&anyhow::Error::new(err))
    }
}

/// Handler-facing error with caller-added fields that survive transport.
///
/// ```
/// use tether::HandlerError;
/// let err = HandlerError::new("quota exceeded").with_field("code", 429);
/// assert_eq!(err.field("code"), Some(&serde_json::json!(429)));
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    fields: Map<String, Value>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field copied into the error record. `message` and `stack` are ignored.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if RESERVED_FIELDS.contains(&key.as_str()) {
            log::debug!("ignoring reserved error field {}", key);
            return self;
        }
        self.fields.insert(key, value.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
