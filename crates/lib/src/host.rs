//! Host side: issues correlated requests to a worker and routes what comes back.
//!
//! Responses are matched to pending requests by id. Notifications (`error`, `console`) are
//! handed to the caller on a separate receiver.

use crate::errors::ErrorRecord;
use crate::protocol::{ConsolePayload, FrameName, InboundMessage, OutboundFrame};
use crate::transport::{FrameSink, FrameSource, TransportError};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

type Outcome = Result<Value, ErrorRecord>;

/// `None` once the worker is gone; dropping the senders fails every waiter.
type Pending = Arc<Mutex<Option<HashMap<String, oneshot::Sender<Outcome>>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, Option<HashMap<String, oneshot::Sender<Outcome>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a request's entry when its future completes or is dropped.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: String,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        if let Some(map) = lock(self.pending).as_mut() {
            map.remove(&self.id);
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("request rejected: {0}")]
    Rejected(ErrorRecord),
    #[error("request could not be sent: {0}")]
    Transport(#[from] TransportError),
    #[error("worker disconnected before responding")]
    Disconnected,
}

/// Uncorrelated frame forwarded by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Error(ErrorRecord),
    Console(ConsolePayload),
}

/// One connection to one worker.
pub struct HostConnection {
    sink: Box<dyn FrameSink<InboundMessage>>,
    pending: Pending,
    reader: JoinHandle<()>,
}

impl HostConnection {
    /// Start routing frames from `source`. Notifications arrive on the returned receiver,
    /// which ends once the worker's channel ends.
    pub fn connect<K, S>(sink: K, source: S) -> (Self, mpsc::UnboundedReceiver<Notification>)
    where
        K: FrameSink<InboundMessage> + 'static,
        S: FrameSource<OutboundFrame> + 'static,
    {
        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_frames(source, pending.clone(), notify_tx));
        (
            Self {
                sink: Box::new(sink),
                pending,
                reader,
            },
            notify_rx,
        )
    }

    /// Send one request and wait for its terminal response.
    pub async fn request(&self, name: impl Into<String>, data: Value) -> Result<Value, HostError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(map) => map.insert(id.clone(), tx),
            None => return Err(HostError::Disconnected),
        };
        let entry = PendingEntry {
            pending: &self.pending,
            id,
        };
        self.sink
            .send(InboundMessage::new(entry.id.clone(), name, data))?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(record)) => Err(HostError::Rejected(record)),
            Err(_) => Err(HostError::Disconnected),
        }
    }

    /// Requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).as_ref().map_or(0, HashMap::len)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.pending).is_some()
    }

    /// Stop sending and wait until the worker's side of the channel ends.
    pub async fn close(self) {
        self.sink.close();
        drop(self.sink);
        if let Err(e) = self.reader.await {
            log::warn!("host reader task failed: {}", e);
        }
    }
}

async fn read_frames<S>(mut source: S, pending: Pending, notify: mpsc::UnboundedSender<Notification>)
where
    S: FrameSource<OutboundFrame>,
{
    while let Some(next) = source.recv().await {
        match next {
            Ok(frame) => route(frame, &pending, &notify),
            Err(e) => log::warn!("skipping worker frame: {}", e),
        }
    }
    let orphaned = lock(&pending).take().map_or(0, |m| m.len());
    if orphaned > 0 {
        log::debug!("worker channel ended with {} request(s) outstanding", orphaned);
    }
}

fn route(frame: OutboundFrame, pending: &Pending, notify: &mpsc::UnboundedSender<Notification>) {
    let notification = match frame.name {
        FrameName::RespondResolve | FrameName::RespondReject => {
            let Some(id) = frame.id else {
                log::warn!("dropping {:?} frame without id", frame.name);
                return;
            };
            let waiter = lock(pending).as_mut().and_then(|m| m.remove(&id));
            let Some(waiter) = waiter else {
                log::warn!("dropping response for unknown id {}", id);
                return;
            };
            let outcome = if frame.name == FrameName::RespondResolve {
                Ok(frame.data)
            } else {
                Err(ErrorRecord::from_value(frame.data))
            };
            let _ = waiter.send(outcome);
            return;
        }
        FrameName::Error => Notification::Error(ErrorRecord::from_value(frame.data)),
        FrameName::Console => match serde_json::from_value::<ConsolePayload>(frame.data) {
            Ok(payload) => Notification::Console(payload),
            Err(e) => {
                log::warn!("dropping malformed console notification: {}", e);
                return;
            }
        },
    };
    let _ = notify.send(notification);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ConsoleLevel;
    use crate::transport::channel;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn resolve_and_reject_are_matched_by_id() {
        let (host, mut worker) = channel::pair();
        let (conn, _notes) = HostConnection::connect(host.sink, host.source);

        let responder = tokio::spawn(async move {
            let first = worker.source.recv().await.unwrap().unwrap();
            let second = worker.source.recv().await.unwrap().unwrap();
            // answer in reverse order
            worker
                .sink
                .send(OutboundFrame::reject(second.id, &ErrorRecord::new("nope")))
                .unwrap();
            worker.sink.send(OutboundFrame::resolve(first.id, json!(1))).unwrap();
            worker
        });

        let (a, b) = tokio::join!(conn.request("one", json!(null)), async {
            tokio::task::yield_now().await;
            conn.request("two", json!(null)).await
        });
        assert_eq!(a.unwrap(), json!(1));
        match b {
            Err(HostError::Rejected(record)) => assert_eq!(record.message, "nope"),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(conn.pending_count(), 0);
        drop(responder.await.unwrap());
    }

    #[tokio::test]
    async fn notifications_and_unknown_ids() {
        let (host, worker) = channel::pair();
        let (conn, mut notes) = HostConnection::connect(host.sink, host.source);

        worker.sink.send(OutboundFrame::resolve("stray", json!(0))).unwrap();
        worker
            .sink
            .send(OutboundFrame::console(&ConsolePayload {
                level: ConsoleLevel::Warn,
                args: json!(["careful"]),
            }))
            .unwrap();
        worker.sink.send(OutboundFrame::error(json!("bare message"))).unwrap();

        assert_eq!(
            notes.recv().await.unwrap(),
            Notification::Console(ConsolePayload {
                level: ConsoleLevel::Warn,
                args: json!(["careful"]),
            })
        );
        match notes.recv().await.unwrap() {
            Notification::Error(record) => assert_eq!(record.message, "bare message"),
            other => panic!("expected error notification, got {:?}", other),
        }
        drop(worker);
        assert!(notes.recv().await.is_none());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn dropped_worker_fails_pending_requests() {
        let (host, mut worker) = channel::pair();
        let (conn, _notes) = HostConnection::connect(host.sink, host.source);

        let closer = tokio::spawn(async move {
            let _request = worker.source.recv().await;
            drop(worker);
        });
        let err = conn.request("ping", json!(null)).await.unwrap_err();
        assert!(matches!(err, HostError::Disconnected));
        closer.await.unwrap();

        let err = conn.request("ping", json!(null)).await.unwrap_err();
        assert!(matches!(err, HostError::Disconnected));
    }

    #[tokio::test]
    async fn abandoned_request_leaves_no_pending_entry() {
        let (host, mut worker) = channel::pair();
        let (conn, _notes) = HostConnection::connect(host.sink, host.source);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), conn.request("ping", json!(null))).await;
        assert!(abandoned.is_err());
        assert_eq!(conn.pending_count(), 0);

        // the late answer is dropped as unknown and the connection keeps working
        let sent = worker.source.recv().await.unwrap().unwrap();
        worker.sink.send(OutboundFrame::resolve(sent.id, json!("late"))).unwrap();
        let answered = tokio::spawn(async move {
            let next = worker.source.recv().await.unwrap().unwrap();
            worker.sink.send(OutboundFrame::resolve(next.id, json!("pong"))).unwrap();
            worker
        });
        assert_eq!(conn.request("ping", json!(null)).await.unwrap(), json!("pong"));
        drop(answered.await.unwrap());
    }
}
