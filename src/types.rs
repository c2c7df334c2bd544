//! Core types for the chat exchange manager
//!
//! This module holds the conversation data model ([`Message`] and friends), the
//! outbound intent of one exchange ([`ExchangeRequest`]), the decoded protocol
//! units of a streaming response ([`ProtocolFrame`]), and the JSON shapes the
//! backend speaks on the wire.
//!
//! # Wire Shapes
//!
//! Both transport modes POST the same [`ChatPayload`] to the same endpoint. A
//! buffered call answers with a [`ReplyEnvelope`]:
//!
//! ```text
//! { "reply": { "text": "...", "thinking": null, "references": [...], "source_pipeline": "..." } }
//! ```
//!
//! A streaming call answers with `data: {"type": ..., "content": ...}` records,
//! decoded by [`crate::decoder`] into [`ProtocolFrame`]s. The `content` of a
//! `final` record has the same shape as `reply` above.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// CONVERSATION DATA MODEL
// ============================================================================

/// Opaque, stable identifier of a conversational turn.
///
/// Assigned once when the turn is created and never reassigned. A placeholder
/// and the final message it becomes share the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generates a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Author of a turn
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// How a turn ended. `None` on a [`Message`] means it is still streaming.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Finalized normally
    Completed,
    /// Transport, protocol, or backend-reported failure
    Failed,
    /// Stopped by the caller
    Cancelled,
}

/// A citation attached to an assistant answer.
///
/// Accepts both `{index, source, preview}` and the backend's
/// `{number, source, content_preview, url}` spelling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reference {
    #[serde(alias = "number", default)]
    pub index: u32,
    #[serde(default)]
    pub source: String,
    #[serde(alias = "content_preview", default)]
    pub preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Reference {
    pub fn new(index: u32, source: impl Into<String>, preview: impl Into<String>) -> Self {
        Self {
            index,
            source: source.into(),
            preview: preview.into(),
            url: None,
        }
    }
}

/// One conversational turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    /// Finalized display text; empty while streaming.
    pub text: String,
    /// Accumulated intermediate text, present only when the exchange asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_trace: Option<String>,
    pub is_streaming: bool,
    pub timestamp: DateTime<Utc>,
    /// Provenance tag, set on assistant turns when they finalize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Reference>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<TurnOutcome>,
}

impl Message {
    /// A completed user turn.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::User,
            text: text.into(),
            reasoning_trace: None,
            is_streaming: false,
            timestamp: Utc::now(),
            source_label: None,
            references: None,
            outcome: Some(TurnOutcome::Completed),
        }
    }

    /// The provisional assistant turn created when an exchange is admitted.
    ///
    /// When `wants_reasoning_trace` is set the trace starts out as an empty
    /// string so partial reasoning can be appended to it.
    pub fn placeholder(wants_reasoning_trace: bool) -> Self {
        Self {
            id: MessageId::new(),
            role: Role::Assistant,
            text: String::new(),
            reasoning_trace: wants_reasoning_trace.then(String::new),
            is_streaming: true,
            timestamp: Utc::now(),
            source_label: None,
            references: None,
            outcome: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.outcome == Some(TurnOutcome::Failed)
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == Some(TurnOutcome::Cancelled)
    }

    /// Finished without failing or being cancelled.
    pub fn is_completed(&self) -> bool {
        self.outcome == Some(TurnOutcome::Completed)
    }
}

// ============================================================================
// OUTBOUND REQUEST
// ============================================================================

/// One-shot tool toggles forwarded with a request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolFlags {
    pub web_search: bool,
    pub academic_search: bool,
    pub critical_thinking: bool,
}

impl ToolFlags {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Flags enabled in either set.
    pub fn union(self, other: ToolFlags) -> ToolFlags {
        ToolFlags {
            web_search: self.web_search || other.web_search,
            academic_search: self.academic_search || other.academic_search,
            critical_thinking: self.critical_thinking || other.critical_thinking,
        }
    }
}

/// Per-submission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// Streams partial reasoning before the answer; otherwise one buffered call.
    pub wants_reasoning_trace: bool,
    /// Name of the document or subject the answer should be grounded in.
    pub context_ref: Option<String>,
    pub tool_flags: ToolFlags,
}

impl ExchangeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reasoning_trace(mut self, wants: bool) -> Self {
        self.wants_reasoning_trace = wants;
        self
    }

    pub fn with_context_ref(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }

    pub fn with_tool_flags(mut self, flags: ToolFlags) -> Self {
        self.tool_flags = flags;
        self
    }

    /// Web and academic search are unavailable while a document context is
    /// selected; this clears them.
    pub fn normalized(mut self) -> Self {
        if self.context_ref.is_some() {
            self.tool_flags.web_search = false;
            self.tool_flags.academic_search = false;
        }
        self
    }
}

/// A prior turn as forwarded to the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryTurn {
    /// `"user"` or `"model"`
    pub role: String,
    pub parts: Vec<HistoryPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryPart {
    pub text: String,
}

impl HistoryTurn {
    /// Completed turns only; failed, cancelled and streaming turns are not
    /// part of the history the model sees.
    pub fn from_message(message: &Message) -> Option<Self> {
        if !message.is_completed() || message.is_streaming {
            return None;
        }
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        Some(Self {
            role: role.to_string(),
            parts: vec![HistoryPart {
                text: message.text.clone(),
            }],
        })
    }
}

/// The outbound intent of one exchange. Immutable once built.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    query_text: String,
    conversation_id: String,
    options: ExchangeOptions,
    history: Vec<HistoryTurn>,
    cancel_token: CancellationToken,
}

impl ExchangeRequest {
    pub fn new(
        query_text: impl Into<String>,
        conversation_id: impl Into<String>,
        options: ExchangeOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            query_text: query_text.into(),
            conversation_id: conversation_id.into(),
            options: options.normalized(),
            history: Vec::new(),
            cancel_token,
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn query_text(&self) -> &str {
        &self.query_text
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn options(&self) -> &ExchangeOptions {
        &self.options
    }

    pub fn history(&self) -> &[HistoryTurn] {
        &self.history
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn wants_reasoning_trace(&self) -> bool {
        self.options.wants_reasoning_trace
    }
}

/// JSON body of the "send chat message" call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub query: String,
    pub session_id: String,
    pub stream: bool,
    pub history: Vec<HistoryTurn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_context_name: Option<String>,
    pub use_web_search: bool,
    pub use_academic_search: bool,
    pub critical_thinking_enabled: bool,
}

impl ChatPayload {
    pub fn from_request(request: &ExchangeRequest, system_prompt: Option<&str>) -> Self {
        let options = request.options();
        Self {
            query: request.query_text().trim().to_string(),
            session_id: request.conversation_id().to_string(),
            stream: options.wants_reasoning_trace,
            history: request.history().to_vec(),
            system_prompt: system_prompt.map(str::to_string),
            document_context_name: options.context_ref.clone(),
            use_web_search: options.tool_flags.web_search,
            use_academic_search: options.tool_flags.academic_search,
            critical_thinking_enabled: options.tool_flags.critical_thinking,
        }
    }
}

// ============================================================================
// INBOUND RESPONSE
// ============================================================================

/// The final answer, carried by a buffered reply or a `final` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FinalMessage {
    pub text: String,
    #[serde(
        rename = "thinking",
        alias = "reasoning_trace",
        alias = "reasoningTrace",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reasoning_trace: Option<String>,
    #[serde(
        rename = "source_pipeline",
        alias = "sourcePipeline",
        alias = "source_label",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub source_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<Vec<Reference>>,
}

impl FinalMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Interprets the `content` of a `final` record.
    ///
    /// A bare string is the answer text; an object is either the message
    /// itself or a `{reply: ...}` envelope.
    pub fn from_content(content: serde_json::Value) -> Result<Self> {
        match content {
            serde_json::Value::String(text) => Ok(Self::text(text)),
            serde_json::Value::Object(mut map) => {
                let value = match map.remove("reply") {
                    Some(reply) => reply,
                    None => serde_json::Value::Object(map),
                };
                serde_json::from_value(value)
                    .map_err(|e| Error::protocol(format!("invalid final message: {}", e)))
            }
            other => Err(Error::protocol(format!(
                "final frame content must be a string or object, got {}",
                other
            ))),
        }
    }
}

/// Body of a successful buffered call.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyEnvelope {
    pub reply: FinalMessage,
}

impl ReplyEnvelope {
    /// Parses a buffered body; an empty or shapeless body is a protocol error.
    pub fn parse(body: &str) -> Result<FinalMessage> {
        if body.trim().is_empty() {
            return Err(Error::protocol("empty response body"));
        }
        let envelope: ReplyEnvelope = serde_json::from_str(body)
            .map_err(|e| Error::protocol(format!("invalid response from AI service: {}", e)))?;
        Ok(envelope.reply)
    }
}

/// A decoded unit of a streaming response.
///
/// Any number of `PartialReasoning` frames may precede exactly one terminal
/// `Final` or `Error` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolFrame {
    PartialReasoning(String),
    Final(FinalMessage),
    Error(String),
}

impl ProtocolFrame {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProtocolFrame::Final(_) | ProtocolFrame::Error(_))
    }
}
