//! Raw channel between host and worker.
//!
//! The core only needs two primitives: send one frame, receive the next frame. Sinks are
//! synchronous (sending never suspends the caller); sources are async and must be
//! cancel-safe, because the dispatcher races `recv` against in-flight handlers.

pub mod channel;
mod json_lines;

pub use json_lines::{JsonLinesSink, JsonLinesSource, WriterHandle, DEFAULT_MAX_FRAME_BYTES};

use async_trait::async_trait;
use serde::Serialize;

/// Appended to any text shortened to fit a limit.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// Transport failure. `TooLarge` and `Encode` mean the frame itself is not transmissible;
/// the channel is still usable and a smaller frame may succeed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("frame encoding failed: {0}")]
    Encode(serde_json::Error),
    #[error("frame decoding failed: {0}")]
    Decode(serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when this frame could not be sent but the channel is still open.
    pub fn is_frame_rejected(&self) -> bool {
        matches!(self, TransportError::TooLarge { .. } | TransportError::Encode(_))
    }

    /// Byte limit reported by a `TooLarge` refusal.
    pub fn frame_limit(&self) -> Option<usize> {
        match self {
            TransportError::TooLarge { limit, .. } => Some(*limit),
            _ => None,
        }
    }
}

/// Bytes left for one string field of `empty_frame` (a frame whose string field is `""`)
/// before its encoding reaches `limit`.
pub(crate) fn string_budget<F: Serialize>(limit: usize, empty_frame: &F) -> usize {
    let envelope = match serde_json::to_string(empty_frame) {
        Ok(encoded) => encoded.len().saturating_sub(2),
        Err(_) => return 0,
    };
    limit.saturating_sub(envelope)
}

fn encoded_len(text: &str) -> usize {
    serde_json::to_string(text).map_or(usize::MAX, |e| e.len().saturating_sub(2))
}

/// Longest prefix of `text` whose JSON string encoding, marker included, fits in `budget`
/// bytes. Cuts on char boundaries; empty when not even the marker fits.
pub(crate) fn fit_json_string(text: &str, budget: usize) -> String {
    if encoded_len(text) <= budget {
        return text.to_string();
    }
    let with_marker = |cut: usize| format!("{}{}", &text[..cut], TRUNCATION_MARKER);
    let mut cuts: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|&i| i <= budget)
        .collect();
    if text.len() <= budget {
        cuts.push(text.len());
    }
    let fitting = cuts.partition_point(|&cut| encoded_len(&with_marker(cut)) <= budget);
    match fitting {
        0 => String::new(),
        n => with_marker(cuts[n - 1]),
    }
}

/// Outgoing half of a channel.
pub trait FrameSink<T>: Send + Sync {
    fn send(&self, frame: T) -> Result<(), TransportError>;

    /// Stop accepting frames. Later sends fail with [`TransportError::Closed`].
    fn close(&self) {}
}

/// Incoming half of a channel. `None` means the peer is gone.
#[async_trait]
pub trait FrameSource<T>: Send {
    async fn recv(&mut self) -> Option<Result<T, TransportError>>;
}
