//! Per-message context: the inbound message plus an idempotent response handle.

use crate::errors::{ErrorRecord, HandlerError};
use crate::protocol::{InboundMessage, OutboundFrame};
use crate::transport::{fit_json_string, string_budget, FrameSink, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Outbound half as seen by the worker.
pub type OutboundSink = Arc<dyn FrameSink<OutboundFrame>>;

/// Terminal-response state of one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResolutionState {
    Pending = 0,
    Resolved = 1,
    Rejected = 2,
}

impl ResolutionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ResolutionState::Resolved,
            2 => ResolutionState::Rejected,
            _ => ResolutionState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != ResolutionState::Pending
    }
}

struct HandleInner {
    id: String,
    state: AtomicU8,
    sink: OutboundSink,
}

/// Sends at most one response for a correlation id; every call after the first is a no-op.
#[derive(Clone)]
pub struct ResponseHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ResponseHandle {
    pub fn new(id: impl Into<String>, sink: OutboundSink) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: id.into(),
                state: AtomicU8::new(ResolutionState::Pending as u8),
                sink,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> ResolutionState {
        ResolutionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Whether a terminal response has already been sent (or attempted).
    pub fn resolved(&self) -> bool {
        self.state().is_terminal()
    }

    /// Send `respond_resolve`. Returns true iff this call was the terminal one.
    ///
    /// Data that cannot be turned into JSON rejects the request instead.
    pub fn resolve<T: Serialize>(&self, data: T) -> bool {
        if self.resolved() {
            return false;
        }
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                return self.reject(HandlerError::new(format!(
                    "response for {} is not serializable: {}",
                    self.inner.id, e
                )));
            }
        };
        if !self.transition(ResolutionState::Resolved) {
            return false;
        }
        match self.inner.sink.send(OutboundFrame::resolve(self.inner.id.clone(), data)) {
            Ok(()) => {}
            Err(e) if e.is_frame_rejected() => {
                log::warn!("response for {} not transmissible, rejecting: {}", self.inner.id, e);
                self.inner.state.store(ResolutionState::Rejected as u8, Ordering::SeqCst);
                let record = ErrorRecord::new(format!("response for {} could not be sent: {}", self.inner.id, e));
                self.send_reject(&record);
            }
            Err(e) => self.log_send_failure(&e),
        }
        true
    }

    /// Send `respond_reject` with the normalized error. Returns true iff this call was the terminal one.
    pub fn reject(&self, error: impl Into<ErrorRecord>) -> bool {
        if !self.transition(ResolutionState::Rejected) {
            return false;
        }
        let record = error.into();
        self.send_reject(&record);
        true
    }

    fn transition(&self, to: ResolutionState) -> bool {
        self.inner
            .state
            .compare_exchange(
                ResolutionState::Pending as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// A refused reject is retried as the bare message, cut to the sink's limit, so the host
    /// always gets an answer.
    fn send_reject(&self, record: &ErrorRecord) {
        let id = &self.inner.id;
        match self.inner.sink.send(OutboundFrame::reject(id.clone(), record)) {
            Ok(()) => {}
            Err(e) if e.is_frame_rejected() => {
                log::warn!("reject for {} not transmissible, sending message only: {}", id, e);
                let message = match e.frame_limit() {
                    Some(limit) => {
                        let empty = OutboundFrame::reject(id.clone(), &ErrorRecord::new(""));
                        fit_json_string(&record.message, string_budget(limit, &empty))
                    }
                    None => record.message.clone(),
                };
                let reduced = OutboundFrame::reject(id.clone(), &ErrorRecord::new(message));
                if let Err(e) = self.inner.sink.send(reduced) {
                    self.log_send_failure(&e);
                }
            }
            Err(e) => self.log_send_failure(&e),
        }
    }

    fn log_send_failure(&self, e: &TransportError) {
        log::warn!("failed to send response for {}: {}", self.inner.id, e);
    }
}

/// What a handler receives: the message and the handle that answers it.
#[derive(Debug, Clone)]
pub struct MessageContext {
    msg: InboundMessage,
    handle: ResponseHandle,
}

impl MessageContext {
    /// Wrap one inbound message with a fresh, pending response handle.
    pub fn new(msg: InboundMessage, sink: OutboundSink) -> Self {
        let handle = ResponseHandle::new(msg.id.clone(), sink);
        Self { msg, handle }
    }

    pub fn message(&self) -> &InboundMessage {
        &self.msg
    }

    pub fn id(&self) -> &str {
        &self.msg.id
    }

    pub fn name(&self) -> &str {
        &self.msg.name
    }

    pub fn data(&self) -> &Value {
        &self.msg.data
    }

    pub fn handle(&self) -> &ResponseHandle {
        &self.handle
    }

    pub fn into_parts(self) -> (InboundMessage, ResponseHandle) {
        (self.msg, self.handle)
    }

    pub fn resolve<T: Serialize>(&self, data: T) -> bool {
        self.handle.resolve(data)
    }

    pub fn reject(&self, error: impl Into<ErrorRecord>) -> bool {
        self.handle.reject(error)
    }

    pub fn resolved(&self) -> bool {
        self.handle.resolved()
    }
}
