//! Tether core library: correlated request/response messaging between a host and a worker
//! over a raw frame channel, plus forwarding of worker diagnostics to the host.

pub mod config;
pub mod errors;
pub mod host;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use errors::{ErrorRecord, HandlerError};
pub use host::{HostConnection, HostError, Notification};
pub use protocol::{ConsoleLevel, ConsolePayload, FrameName, InboundMessage, OutboundFrame};
pub use worker::{DiagnosticsForwarder, Dispatcher, HandlerTable, MessageContext, ResponseHandle};
