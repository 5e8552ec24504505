//! In-process channel pair (tokio unbounded mpsc). Frames are moved, not serialized.

use super::{FrameSink, FrameSource, TransportError};
use crate::protocol::{InboundMessage, OutboundFrame};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Sending half backed by an unbounded mpsc sender.
pub struct ChannelSink<T> {
    tx: mpsc::UnboundedSender<T>,
    closed: AtomicBool,
}

impl<T: Send> FrameSink<T> for ChannelSink<T> {
    fn send(&self, frame: T) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Receiving half backed by an unbounded mpsc receiver.
pub struct ChannelSource<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

#[async_trait]
impl<T: Send> FrameSource<T> for ChannelSource<T> {
    async fn recv(&mut self) -> Option<Result<T, TransportError>> {
        self.rx.recv().await.map(Ok)
    }
}

/// One direction of the channel.
pub fn unbounded<T>() -> (ChannelSink<T>, ChannelSource<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        ChannelSink {
            tx,
            closed: AtomicBool::new(false),
        },
        ChannelSource { rx },
    )
}

/// Host side of an in-process pair: sends requests, receives responses and notifications.
pub struct HostEnd {
    pub sink: ChannelSink<InboundMessage>,
    pub source: ChannelSource<OutboundFrame>,
}

/// Worker side of an in-process pair: receives requests, sends responses and notifications.
pub struct WorkerEnd {
    pub sink: ChannelSink<OutboundFrame>,
    pub source: ChannelSource<InboundMessage>,
}

/// Create a connected host/worker pair.
pub fn pair() -> (HostEnd, WorkerEnd) {
    let (to_worker, from_host) = unbounded();
    let (to_host, from_worker) = unbounded();
    (
        HostEnd {
            sink: to_worker,
            source: from_worker,
        },
        WorkerEnd {
            sink: to_host,
            source: from_host,
        },
    )
}
