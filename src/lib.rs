//! # Chat Exchange - Streaming Exchange Manager
//!
//! Client-side engine that runs one request/response exchange at a time per
//! conversation against a chat backend, keeping the conversation's message
//! list consistent while the answer arrives.
//!
//! ## Overview
//!
//! A submission turns into an *exchange*:
//!
//! 1. The user's turn and an assistant **placeholder** are appended to the
//!    conversation.
//! 2. The backend is called either **buffered** (one JSON reply) or
//!    **streamed** (`text/event-stream` of `partial_reasoning`, `final` and
//!    `error` records), depending on whether a reasoning trace was requested.
//! 3. The placeholder is updated in place, by id, as frames arrive and ends
//!    in exactly one terminal state: finalized, failed, or cancelled.
//!
//! ## Key Features
//!
//! - **One exchange per conversation**: a second submission is rejected with
//!   [`Error::Busy`] instead of racing the first
//! - **Chunk-boundary safe decoding**: records split across network reads
//!   are reassembled before parsing
//! - **Id-keyed commits**: updates never depend on list position
//! - **Cancellation**: stop an exchange from anywhere; nothing is applied
//!   after the cancelled commit
//! - **Progress events**: placeholder, reasoning deltas and completion are
//!   broadcast to subscribers
//! - **Retry Logic**: optional exponential backoff when opening the call
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chat_exchange::{ExchangeConfig, ExchangeManager, ExchangeOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExchangeConfig::builder()
//!         .base_url("http://localhost:5001/api")
//!         .auth_token("token-from-login")
//!         .build()?;
//!     let manager = ExchangeManager::http(config)?;
//!
//!     // Streamed exchange with a reasoning trace
//!     let options = ExchangeOptions::new().with_reasoning_trace(true);
//!     let outcome = manager
//!         .submit("session-1", "Explain photosynthesis", options)
//!         .await?;
//!
//!     if let Some(trace) = &outcome.message.reasoning_trace {
//!         println!("thinking: {}", trace);
//!     }
//!     println!("{}", outcome.message.text);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: Conversation data model, request payload and wire shapes
//! - **decoder**: Event-stream bytes to protocol frames
//! - **transport**: The `Transport` seam and its HTTP implementation
//! - **exchange**: Pure lifecycle state machine of one exchange
//! - **conversation**: Ordered, id-keyed message store
//! - **guard**: Per-conversation admission control and cancellation tokens
//! - **manager**: Orchestration and progress events
//! - **config**: Manager configuration with environment variable support
//! - **error**: Error types and conversions
//! - **retry**: Exponential backoff retry logic with jitter

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Manager configuration: backend URL, auth token, timeouts, history and retry.
mod config;

/// Ordered message store keyed by message id.
mod conversation;

/// Incremental decoding of `data:` records into protocol frames.
/// Buffers partial records across chunk boundaries and stops after a terminal frame.
mod decoder;

/// Error types shared by every public API.
mod error;

/// Lifecycle state machine of one exchange.
mod exchange;

/// At-most-one in-flight exchange per conversation.
mod guard;

/// Submission, cancellation and progress events.
mod manager;

/// Transport trait and the HTTP adapter.
mod transport;

/// Conversation data model and wire types.
mod types;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

// --- Manager ---

pub use manager::{ExchangeEvent, ExchangeManager, ExchangeOutcome};

// --- Configuration ---

pub use config::{
    AUTH_TOKEN_ENV, BASE_URL_ENV, DEFAULT_ENDPOINT, ExchangeConfig, ExchangeConfigBuilder,
};

// --- Error Handling ---

pub use error::{Error, Result, TransportError};

// --- Lifecycle Building Blocks ---

pub use conversation::Conversation;
pub use exchange::{Applied, Exchange, ExchangeState};
pub use guard::{CancelHandle, Lease, SessionGuard};

// --- Transport ---

pub use decoder::{decode_frames, parse_record, single_final};
pub use transport::{ChunkStream, FrameStream, HttpTransport, Transport, TransportResponse};

// --- Core Types ---

pub use types::{
    ChatPayload, ExchangeOptions, ExchangeRequest, FinalMessage, HistoryPart, HistoryTurn,
    Message, MessageId, ProtocolFrame, Reference, ReplyEnvelope, Role, ToolFlags, TurnOutcome,
};

// Re-exported so custom transports can observe the request's token without
// depending on tokio-util directly.
pub use tokio_util::sync::CancellationToken;

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// Convenience module containing the most commonly used types.
/// Import with `use chat_exchange::prelude::*;`.
pub mod prelude {
    pub use crate::{
        Error, ExchangeConfig, ExchangeEvent, ExchangeManager, ExchangeOptions, ExchangeOutcome,
        ExchangeState, Message, MessageId, ProtocolFrame, Result, ToolFlags, Transport,
        TransportResponse,
    };
}
