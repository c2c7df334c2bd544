//! Exchange manager: the entry point for submitting and cancelling exchanges
//!
//! [`ExchangeManager`] ties the pieces together for every submission:
//!
//! ```text
//! submit(conversation, query, options)
//!     │
//!     ├─> SessionGuard::admit          (Busy if an exchange is in flight)
//!     │
//!     ├─> user turn + placeholder appended, PlaceholderCreated emitted
//!     │
//!     ├─> Transport::send              (buffered or streamed)
//!     │
//!     ├─> frames applied in order, each update committed by id,
//!     │   ReasoningDelta emitted per partial
//!     │
//!     ├─> terminal state committed, Completed emitted
//!     │
//!     └─> lease released               (always, including on drop)
//! ```
//!
//! Every submission that passes admission ends with exactly one terminal
//! commit of its placeholder. Transport, protocol and server failures are
//! reported inside the returned [`ExchangeOutcome`], not as `Err`; the caller
//! always gets a conversation that is consistent with the outcome.
//!
//! ## Cancellation
//!
//! [`ExchangeManager::cancel`] records the cancelled turn synchronously and
//! fires the exchange's token. The driver observes the token before applying
//! each frame, so nothing arrives after the cancelled commit.

use crate::config::ExchangeConfig;
use crate::conversation::Conversation;
use crate::exchange::{Applied, Exchange, ExchangeState};
use crate::guard::SessionGuard;
use crate::transport::{HttpTransport, Transport};
use crate::types::{ExchangeOptions, ExchangeRequest, Message, MessageId, ProtocolFrame, ToolFlags};
use crate::{Error, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// Progress notification published while exchanges run.
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    /// The user turn and its assistant placeholder were appended.
    PlaceholderCreated {
        conversation_id: String,
        user: Message,
        placeholder: Message,
    },
    /// A piece of reasoning was appended to the placeholder's trace.
    ReasoningDelta {
        conversation_id: String,
        message_id: MessageId,
        delta: String,
    },
    /// The placeholder reached its terminal state.
    Completed {
        conversation_id: String,
        state: ExchangeState,
        message: Message,
    },
}

impl ExchangeEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            ExchangeEvent::PlaceholderCreated {
                conversation_id, ..
            }
            | ExchangeEvent::ReasoningDelta {
                conversation_id, ..
            }
            | ExchangeEvent::Completed {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Result of a submission that passed admission.
#[derive(Debug)]
pub struct ExchangeOutcome {
    /// Terminal state of the exchange
    pub state: ExchangeState,
    /// The committed assistant turn
    pub message: Message,
    /// Id of the user turn appended for this submission
    pub user_message_id: MessageId,
    /// Underlying condition when `state` is `Failed`
    pub error: Option<Error>,
}

impl ExchangeOutcome {
    pub fn message_id(&self) -> &MessageId {
        &self.message.id
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ExchangeState::Finalized
    }

    pub fn is_failed(&self) -> bool {
        self.state == ExchangeState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == ExchangeState::Cancelled
    }
}

#[derive(Debug, Default)]
struct ConversationEntry {
    conversation: Conversation,
    /// Exchange currently owning this conversation's placeholder
    active: Option<Exchange>,
}

type ConversationMap = HashMap<String, ConversationEntry>;

/// Runs exchanges against a [`Transport`] and owns the conversations they
/// write into.
///
/// Cloning is cheap; clones share conversations, the session guard and the
/// event channel, so one clone can cancel what another is driving.
///
/// # Examples
///
/// ```rust,no_run
/// use chat_exchange::{ExchangeConfig, ExchangeManager, ExchangeOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ExchangeConfig::builder()
///     .base_url("http://localhost:5001/api")
///     .build()?;
/// let manager = ExchangeManager::http(config)?;
///
/// let outcome = manager
///     .submit("session-1", "What is the capital of France?", ExchangeOptions::new())
///     .await?;
/// println!("{}", outcome.message.text);
/// # Ok(())
/// # }
/// ```
pub struct ExchangeManager<T = HttpTransport> {
    transport: Arc<T>,
    config: ExchangeConfig,
    guard: SessionGuard,
    conversations: Arc<Mutex<ConversationMap>>,
    events: broadcast::Sender<ExchangeEvent>,
}

impl<T> Clone for ExchangeManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: self.config.clone(),
            guard: self.guard.clone(),
            conversations: Arc::clone(&self.conversations),
            events: self.events.clone(),
        }
    }
}

impl ExchangeManager<HttpTransport> {
    /// Manager over the HTTP transport described by `config`.
    pub fn http(config: ExchangeConfig) -> Result<Self> {
        let transport = HttpTransport::new(&config)?;
        Ok(Self::new(transport, config))
    }
}

impl<T: Transport> ExchangeManager<T> {
    pub fn new(transport: T, config: ExchangeConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            transport: Arc::new(transport),
            config,
            guard: SessionGuard::new(),
            conversations: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Submits a query and drives the exchange to a terminal state.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for a blank query or conversation id
    /// - [`Error::Busy`] if the conversation already has an exchange in
    ///   flight; the conversation is left untouched
    ///
    /// Any other failure is reported in the outcome with state `Failed`.
    pub async fn submit(
        &self,
        conversation_id: &str,
        query_text: &str,
        options: ExchangeOptions,
    ) -> Result<ExchangeOutcome> {
        let query = query_text.trim();
        if query.is_empty() {
            return Err(Error::invalid_input("query text must not be empty"));
        }
        if conversation_id.trim().is_empty() {
            return Err(Error::invalid_input("conversation id must not be empty"));
        }

        let lease = self.guard.admit(conversation_id)?;
        let options = ExchangeOptions {
            tool_flags: options.tool_flags.union(lease.tool_flags()),
            ..options
        };

        let user = Message::user(query);
        let placeholder = Message::placeholder(options.wants_reasoning_trace);
        let user_message_id = user.id.clone();
        let message_id = placeholder.id.clone();

        let history = {
            let mut conversations = self.conversations.lock();
            let entry = conversations.entry(conversation_id.to_string()).or_default();
            let history = if self.config.include_history {
                entry.conversation.history()
            } else {
                Vec::new()
            };
            entry
                .conversation
                .append_placeholder(user.clone(), placeholder.clone());
            entry.active = Some(Exchange::new(placeholder.clone()));
            history
        };

        // From here on the placeholder must reach a terminal commit even if
        // this future is dropped mid-flight.
        let mut abandon = AbandonGuard {
            conversations: &self.conversations,
            events: &self.events,
            conversation_id,
            armed: true,
        };

        log::debug!(
            "Exchange {} started in conversation {} (streaming: {})",
            message_id,
            conversation_id,
            options.wants_reasoning_trace
        );
        self.emit(ExchangeEvent::PlaceholderCreated {
            conversation_id: conversation_id.to_string(),
            user,
            placeholder,
        });

        let request = ExchangeRequest::new(query, conversation_id, options, lease.token().clone())
            .with_history(history);
        let failure = self.drive(&request).await;

        let outcome = self.finish(conversation_id, user_message_id, failure);
        abandon.armed = false;
        lease.release();
        outcome
    }

    /// Cancels the in-flight exchange of `conversation_id`.
    ///
    /// The placeholder is committed as cancelled before this returns. Returns
    /// false when nothing was in flight.
    pub fn cancel(&self, conversation_id: &str) -> bool {
        let fired = self.guard.cancel(conversation_id);

        let mut conversations = self.conversations.lock();
        let Some(entry) = conversations.get_mut(conversation_id) else {
            return fired;
        };
        if let Some(exchange) = entry.active.as_mut() {
            if exchange.cancel() {
                entry
                    .conversation
                    .commit(exchange.id(), exchange.message().clone());
                log::info!(
                    "Exchange {} in conversation {} cancelled",
                    exchange.id(),
                    conversation_id
                );
            }
        }
        fired
    }

    /// Messages of the conversation, oldest first.
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|entry| entry.conversation.to_vec())
            .unwrap_or_default()
    }

    /// A single message by id.
    pub fn message(&self, conversation_id: &str, id: &MessageId) -> Option<Message> {
        self.conversations
            .lock()
            .get(conversation_id)
            .and_then(|entry| entry.conversation.get(id).cloned())
    }

    pub fn is_busy(&self, conversation_id: &str) -> bool {
        self.guard.is_busy(conversation_id)
    }

    /// Sets the one-shot tool toggles for the next submission.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while an exchange is in flight.
    pub fn set_tool_flags(&self, conversation_id: &str, flags: ToolFlags) -> Result<()> {
        self.guard.set_tool_flags(conversation_id, flags)
    }

    pub fn tool_flags(&self, conversation_id: &str) -> ToolFlags {
        self.guard.tool_flags(conversation_id)
    }

    /// Drops every message of the conversation, starting a fresh session.
    ///
    /// # Errors
    ///
    /// [`Error::Busy`] while an exchange is in flight.
    pub fn clear_conversation(&self, conversation_id: &str) -> Result<()> {
        if self.guard.is_busy(conversation_id) {
            return Err(Error::busy(conversation_id));
        }
        let mut conversations = self.conversations.lock();
        // A submit admitted after the guard check may already own a placeholder
        if conversations
            .get(conversation_id)
            .is_some_and(|entry| entry.active.is_some())
        {
            return Err(Error::busy(conversation_id));
        }
        conversations.remove(conversation_id);
        drop(conversations);
        log::debug!("Cleared conversation {}", conversation_id);
        Ok(())
    }

    /// Subscribes to progress events of every conversation.
    pub fn subscribe(&self) -> broadcast::Receiver<ExchangeEvent> {
        self.events.subscribe()
    }

    /// Progress events as a stream. Lagged receivers skip what they missed.
    pub fn event_stream(&self) -> impl futures::Stream<Item = ExchangeEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|event| async move {
            match event {
                Ok(event) => Some(event),
                Err(lagged) => {
                    log::warn!("Event subscriber fell behind: {}", lagged);
                    None
                }
            }
        })
    }

    fn emit(&self, event: ExchangeEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Runs the transport call and applies frames until a terminal frame,
    /// a failure, or cancellation. Returns the condition that ended the
    /// exchange, or `None` when a `final` frame finalized it.
    async fn drive(&self, request: &ExchangeRequest) -> Option<Error> {
        let token = request.cancel_token();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Some(Error::Cancelled),
            response = self.transport.send(request) => response,
        };
        let mut frames = match response {
            Ok(response) => response.into_frames(),
            Err(err) => return Some(err),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Some(Error::Cancelled),
                next = frames.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => return Some(err),
                None => {
                    return Some(Error::protocol(
                        "response stream ended before a final answer",
                    ));
                }
            };

            let server_detail = match &frame {
                ProtocolFrame::Error(detail) => Some(detail.clone()),
                _ => None,
            };

            match self.apply_frame(request.conversation_id(), token, frame) {
                Applied::Reasoning(_) => {}
                Applied::Finalized => return None,
                Applied::Failed(_) => {
                    return Some(Error::server(server_detail.unwrap_or_default()));
                }
                Applied::Discarded => return Some(Error::Cancelled),
            }
        }
    }

    /// Applies one frame to the active exchange and commits the result.
    fn apply_frame(
        &self,
        conversation_id: &str,
        token: &CancellationToken,
        frame: ProtocolFrame,
    ) -> Applied {
        let mut conversations = self.conversations.lock();
        let Some(entry) = conversations.get_mut(conversation_id) else {
            return Applied::Discarded;
        };
        let Some(exchange) = entry.active.as_mut() else {
            return Applied::Discarded;
        };

        // Checked under the lock so a concurrent cancel wins over this frame
        if token.is_cancelled() {
            return Applied::Discarded;
        }

        let applied = exchange.apply(frame);
        match &applied {
            Applied::Reasoning(delta) => {
                entry.conversation.append_trace(exchange.id(), delta);
                self.emit(ExchangeEvent::ReasoningDelta {
                    conversation_id: conversation_id.to_string(),
                    message_id: exchange.id().clone(),
                    delta: delta.clone(),
                });
            }
            Applied::Finalized | Applied::Failed(_) => {
                entry
                    .conversation
                    .commit(exchange.id(), exchange.message().clone());
            }
            Applied::Discarded => {}
        }
        applied
    }

    /// Commits the terminal state and builds the outcome.
    fn finish(
        &self,
        conversation_id: &str,
        user_message_id: MessageId,
        failure: Option<Error>,
    ) -> Result<ExchangeOutcome> {
        let mut conversations = self.conversations.lock();
        let entry = conversations.get_mut(conversation_id);
        let Some((entry, mut exchange)) =
            entry.and_then(|entry| entry.active.take().map(|exchange| (entry, exchange)))
        else {
            log::warn!(
                "Exchange for conversation {} lost its placeholder before completion",
                conversation_id
            );
            return Err(Error::protocol("exchange state lost before completion"));
        };

        if let Some(err) = &failure {
            exchange.fail(err);
        }
        let state = exchange.state();
        let message = exchange.into_message();
        entry.conversation.commit(&message.id, message.clone());
        drop(conversations);

        match state {
            ExchangeState::Finalized => log::info!(
                "Exchange {} in conversation {} finalized",
                message.id,
                conversation_id
            ),
            ExchangeState::Cancelled => log::info!(
                "Exchange {} in conversation {} ended cancelled",
                message.id,
                conversation_id
            ),
            _ => log::warn!(
                "Exchange {} in conversation {} failed: {}",
                message.id,
                conversation_id,
                message.text
            ),
        }

        self.emit(ExchangeEvent::Completed {
            conversation_id: conversation_id.to_string(),
            state,
            message: message.clone(),
        });

        let error = match state {
            ExchangeState::Failed => failure,
            _ => None,
        };
        Ok(ExchangeOutcome {
            state,
            message,
            user_message_id,
            error,
        })
    }
}

/// Commits a still-active placeholder as cancelled if `submit` is dropped
/// before it finishes.
struct AbandonGuard<'a> {
    conversations: &'a Mutex<ConversationMap>,
    events: &'a broadcast::Sender<ExchangeEvent>,
    conversation_id: &'a str,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut conversations = self.conversations.lock();
        let Some(entry) = conversations.get_mut(self.conversation_id) else {
            return;
        };
        let Some(mut exchange) = entry.active.take() else {
            return;
        };
        exchange.cancel();
        log::warn!(
            "Exchange {} in conversation {} dropped before completion",
            exchange.id(),
            self.conversation_id
        );
        let message = exchange.into_message();
        entry.conversation.commit(&message.id, message.clone());
        drop(conversations);

        let _ = self.events.send(ExchangeEvent::Completed {
            conversation_id: self.conversation_id.to_string(),
            state: ExchangeState::Cancelled,
            message,
        });
    }
}
