//! Worker side: message contexts, handler dispatch, and diagnostics forwarding.
//!
//! A worker owns exactly one [`Dispatcher`] (the inbound entry point) and one
//! [`DiagnosticsForwarder`] (the global error/log hooks), both sharing the same outbound sink.

mod context;
mod diagnostics;
mod dispatcher;
mod handlers;

pub use context::{MessageContext, OutboundSink, ResolutionState, ResponseHandle};
pub use diagnostics::{DiagnosticsForwarder, ForwardingLogger, InstallError};
pub use dispatcher::Dispatcher;
pub use handlers::{Handler, HandlerFuture, HandlerTable, HandlerTableBuilder};

use crate::config::Config;
use crate::protocol::{InboundMessage, OutboundFrame};
use crate::transport::{FrameSource, JsonLinesSink, JsonLinesSource};
use anyhow::{Context, Result};
use log::{LevelFilter, Log};
use std::sync::Arc;

/// Run a worker on this process's stdin/stdout until stdin closes.
///
/// `logger` is the process's own logger (e.g. a built `env_logger::Logger`); it is wrapped so
/// log output is both written locally and forwarded to the host.
pub async fn run_stdio_worker(
    config: &Config,
    table: HandlerTable,
    logger: Box<dyn Log>,
    logger_filter: LevelFilter,
) -> Result<()> {
    let (sink, writer) =
        JsonLinesSink::<OutboundFrame>::spawn(tokio::io::stdout(), config.transport.max_frame_bytes);
    let sink: OutboundSink = Arc::new(sink);
    let mut diagnostics = DiagnosticsForwarder::new(sink.clone(), config.diagnostics.clone());
    diagnostics
        .install(logger, logger_filter)
        .context("installing diagnostics forwarding")?;

    let source = JsonLinesSource::<InboundMessage, _>::new(tokio::io::stdin());
    log::info!("worker ready with handlers: {}", table.names().join(", "));
    serve(table, sink.clone(), source).await;

    diagnostics.uninstall();
    writer.finish().await.context("flushing outbound frames")?;
    Ok(())
}

/// Serve one channel with a fresh dispatcher. Returns when the source ends and every
/// in-flight handler has responded.
pub async fn serve<S>(table: HandlerTable, sink: OutboundSink, source: S)
where
    S: FrameSource<InboundMessage>,
{
    Dispatcher::new(table, sink).serve(source).await;
}
