//! Routes inbound messages to handlers and guarantees exactly one terminal response each.

use super::context::{MessageContext, OutboundSink};
use super::diagnostics::{take_contained_panic, HandlerScope};
use super::handlers::{HandlerFuture, HandlerTable};
use crate::errors::{ErrorRecord, HandlerError};
use crate::protocol::InboundMessage;
use crate::transport::FrameSource;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;

/// One per worker. Owns the handler table and the inbound entry point.
pub struct Dispatcher {
    table: HandlerTable,
    sink: OutboundSink,
}

impl Dispatcher {
    pub fn new(table: HandlerTable, sink: OutboundSink) -> Self {
        Self { table, sink }
    }

    pub fn table(&self) -> &HandlerTable {
        &self.table
    }

    /// Handle one inbound message to completion. Never fails: unknown names, handler errors
    /// and handler panics all end as a `respond_reject`.
    pub async fn dispatch(&self, msg: InboundMessage) {
        let ctx = MessageContext::new(msg, self.sink.clone());
        let Some(handler) = self.table.get(ctx.name()).cloned() else {
            log::debug!("no handler for {} (id {})", ctx.name(), ctx.id());
            let error = HandlerError::new(format!("No handler for {}", ctx.name()));
            ctx.reject(error);
            return;
        };
        let handle = ctx.handle().clone();
        let invoke: HandlerFuture = Box::pin(async move { handler(ctx).await });
        match AssertUnwindSafe(HandlerScope::new(invoke)).catch_unwind().await {
            Ok(Ok(value)) => {
                if !handle.resolved() {
                    handle.resolve(value);
                }
            }
            Ok(Err(err)) => {
                if !handle.resolved() {
                    handle.reject(&err);
                }
            }
            Err(payload) => {
                let record = ErrorRecord::from_panic(payload.as_ref(), take_contained_panic());
                log::warn!("handler for {} panicked: {}", handle.id(), record.message);
                if !handle.resolved() {
                    handle.reject(record);
                }
            }
        }
    }

    /// Consume inbound frames until the source ends, running handlers concurrently on this
    /// task. In-flight handlers are drained before returning.
    pub async fn serve<S>(self, mut source: S)
    where
        S: FrameSource<InboundMessage>,
    {
        let mut in_flight = FuturesUnordered::new();
        loop {
            tokio::select! {
                next = source.recv() => match next {
                    Some(Ok(msg)) => in_flight.push(self.dispatch(msg)),
                    Some(Err(e)) => log::warn!("skipping inbound frame: {}", e),
                    None => break,
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }
        log::debug!("inbound channel ended; draining {} handler(s)", in_flight.len());
        while in_flight.next().await.is_some() {}
    }
}
