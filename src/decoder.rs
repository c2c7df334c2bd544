//! Event frame decoding for streamed chat responses.
//!
//! A streaming reply is a Server-Sent Events body whose records carry a small
//! JSON envelope:
//!
//! ```text
//! data: {"type": "partial_reasoning", "content": "Looking up capitals..."}
//!
//! data: {"type": "final", "content": {"text": "Paris", "references": []}}
//!
//! ```
//!
//! [`decode_frames`] turns the raw chunk stream into a finite sequence of
//! [`ProtocolFrame`]s:
//!
//! ```text
//! ChunkStream (arbitrary byte boundaries)
//!     │
//!     │ eventsource(): buffers until a blank line completes a record
//!     ▼
//! Stream<Event>
//!     │
//!     │ parse_record(): envelope -> frame, skip malformed / unknown
//!     ▼
//! FrameStream (ends after the first final/error frame or at transport close)
//! ```
//!
//! Record-level failures never end the stream. Only transport closure, a
//! transport error, or a terminal frame does.

use crate::types::{FinalMessage, ProtocolFrame};
use crate::{Error, Result};
use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use std::pin::Pin;

/// Raw body chunks as they arrive from the transport.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Decoded frames of one exchange. Finite and not restartable.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ProtocolFrame>> + Send>>;

/// Wire envelope of one record: `{type, content}`.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Parses the payload of a single `data:` record.
///
/// # Returns
///
/// * `Ok(Some(frame))` - a recognised frame
/// * `Ok(None)` - nothing to emit: unknown `type`, empty payload, or the
///   `[DONE]` sentinel some backends append
/// * `Err(Error::Protocol)` - the record is malformed; callers skip it
pub fn parse_record(data: &str) -> Result<Option<ProtocolFrame>> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let envelope: Envelope = serde_json::from_str(data)
        .map_err(|e| Error::protocol(format!("malformed record: {}", e)))?;

    let frame = match envelope.kind.as_str() {
        "partial_reasoning" => match envelope.content {
            serde_json::Value::String(text) => ProtocolFrame::PartialReasoning(text),
            serde_json::Value::Null => ProtocolFrame::PartialReasoning(String::new()),
            other => {
                return Err(Error::protocol(format!(
                    "partial_reasoning content must be a string, got {}",
                    other
                )));
            }
        },
        "final" => ProtocolFrame::Final(FinalMessage::from_content(envelope.content)?),
        "error" => ProtocolFrame::Error(error_detail(envelope.content)),
        unknown => {
            log::debug!("Ignoring frame with unknown type '{}'", unknown);
            return Ok(None);
        }
    };

    Ok(Some(frame))
}

/// Error frames carry either a string or an object with a `message` field.
fn error_detail(content: serde_json::Value) -> String {
    match content {
        serde_json::Value::String(detail) => detail,
        serde_json::Value::Null => "The server reported an error.".to_string(),
        serde_json::Value::Object(ref map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| content.to_string()),
        other => other.to_string(),
    }
}

/// Decodes a chunked SSE body into protocol frames.
///
/// The returned stream stops pulling from `chunks` as soon as a terminal frame
/// has been yielded, even if the transport still has bytes buffered. A
/// transport error is yielded once and also ends the stream.
pub fn decode_frames(chunks: ChunkStream) -> FrameStream {
    let events = Box::pin(chunks.eventsource());

    let frames = futures::stream::unfold(Some(events), |state| async move {
        let mut events = state?;
        loop {
            let event = match events.next().await? {
                Ok(event) => event,
                Err(EventStreamError::Transport(err)) => return Some((Err(err), None)),
                Err(EventStreamError::Utf8(err)) => {
                    log::warn!("Skipping record with invalid UTF-8: {}", err);
                    continue;
                }
                Err(EventStreamError::Parser(err)) => {
                    log::warn!("Skipping unparseable SSE record: {}", err);
                    continue;
                }
            };

            match parse_record(&event.data) {
                Ok(Some(frame)) => {
                    let next = if frame.is_terminal() {
                        None
                    } else {
                        Some(events)
                    };
                    return Some((Ok(frame), next));
                }
                Ok(None) => continue,
                Err(err) => {
                    log::warn!("Skipping stream record: {}", err);
                    continue;
                }
            }
        }
    });

    Box::pin(frames)
}

/// Wraps an already-decoded answer as a one-frame stream.
///
/// This is how a buffered reply reaches the exchange state machine: a stream
/// of length one containing only the `final` frame.
pub fn single_final(message: FinalMessage) -> FrameStream {
    Box::pin(futures::stream::once(async move {
        Ok(ProtocolFrame::Final(message))
    }))
}
