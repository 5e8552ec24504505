//! Newline-delimited JSON over async byte streams (e.g. a child process's stdin/stdout).

use super::{FrameSink, FrameSource, TransportError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Default upper bound for one encoded frame (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Encodes frames on the caller's thread and hands finished lines to a writer task.
pub struct JsonLinesSink<T> {
    tx: mpsc::UnboundedSender<String>,
    max_frame_bytes: usize,
    closed: AtomicBool,
    _frame: PhantomData<fn(T)>,
}

/// Handle to the background writer spawned by [`JsonLinesSink::spawn`].
pub struct WriterHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

impl WriterHandle {
    /// Write every frame already accepted by the sink, flush, and stop the writer.
    pub async fn finish(self) -> std::io::Result<()> {
        let _ = self.shutdown.send(());
        match self.task.await {
            Ok(res) => res,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
        }
    }
}

impl<T: Serialize> JsonLinesSink<T> {
    /// Spawn the writer task on the current tokio runtime.
    pub fn spawn<W>(writer: W, max_frame_bytes: usize) -> (Self, WriterHandle)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_writer(writer, rx, shutdown_rx));
        (
            Self {
                tx,
                max_frame_bytes,
                closed: AtomicBool::new(false),
                _frame: PhantomData,
            },
            WriterHandle {
                shutdown: shutdown_tx,
                task,
            },
        )
    }

    fn encode(&self, frame: &T) -> Result<String, TransportError> {
        let line = serde_json::to_string(frame).map_err(TransportError::Encode)?;
        if line.len() > self.max_frame_bytes {
            return Err(TransportError::TooLarge {
                size: line.len(),
                limit: self.max_frame_bytes,
            });
        }
        Ok(line)
    }
}

impl<T: Serialize> FrameSink<T> for JsonLinesSink<T> {
    fn send(&self, frame: T) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let line = self.encode(&frame)?;
        self.tx.send(line).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => write_line(&mut writer, &line).await?,
                None => break,
            },
            _ = &mut shutdown => {
                rx.close();
                while let Some(line) = rx.recv().await {
                    write_line(&mut writer, &line).await?;
                }
                break;
            }
        }
    }
    writer.flush().await?;
    log::debug!("json-lines writer stopped");
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Reads one JSON frame per line. Blank lines are skipped.
pub struct JsonLinesSource<T, R> {
    lines: Lines<BufReader<R>>,
    _frame: PhantomData<fn() -> T>,
}

impl<T, R: AsyncRead + Unpin> JsonLinesSource<T, R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            _frame: PhantomData,
        }
    }
}

#[async_trait]
impl<T, R> FrameSource<T> for JsonLinesSource<T, R>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Option<Result<T, TransportError>> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(line).map_err(TransportError::Decode));
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(TransportError::Io(e))),
            }
        }
    }
}
