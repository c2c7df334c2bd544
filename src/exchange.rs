//! Lifecycle of one request/response pair.
//!
//! An [`Exchange`] owns the assistant placeholder of a single submission and
//! moves it through:
//!
//! ```text
//! Pending ──first frame──> Streaming ──final──> Finalized
//!    │                        │
//!    │                        ├──error frame / adapter failure──> Failed
//!    │                        │
//!    └────────────────────────┴──cancel──> Cancelled
//! ```
//!
//! Transitions are pure: no I/O happens here, the caller feeds frames in
//! arrival order and commits the resulting message. Terminal states are final;
//! anything applied after one is discarded.

use crate::types::{FinalMessage, Message, MessageId, ProtocolFrame, TurnOutcome};
use crate::Error;

/// Lifecycle state of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Admitted, no frame seen yet
    Pending,
    /// At least one frame applied, no terminal frame yet
    Streaming,
    Finalized,
    Failed,
    Cancelled,
}

impl ExchangeState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExchangeState::Finalized | ExchangeState::Failed | ExchangeState::Cancelled
        )
    }
}

/// What applying one frame did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Reasoning text appended to the trace
    Reasoning(String),
    Finalized,
    /// Turned into a failed turn showing this text
    Failed(String),
    /// Ignored because the exchange had already terminated
    Discarded,
}

/// State machine for one exchange.
#[derive(Debug, Clone)]
pub struct Exchange {
    placeholder: Message,
    state: ExchangeState,
    wants_reasoning_trace: bool,
}

impl Exchange {
    /// Starts an exchange in `Pending` around a fresh placeholder.
    pub fn new(placeholder: Message) -> Self {
        let wants_reasoning_trace = placeholder.reasoning_trace.is_some();
        Self {
            placeholder,
            state: ExchangeState::Pending,
            wants_reasoning_trace,
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.placeholder.id
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Current view of the assistant turn.
    pub fn message(&self) -> &Message {
        &self.placeholder
    }

    pub fn into_message(self) -> Message {
        self.placeholder
    }

    /// Applies one frame in arrival order.
    pub fn apply(&mut self, frame: ProtocolFrame) -> Applied {
        if self.state.is_terminal() {
            log::debug!(
                "Discarding frame for exchange {} in terminal state {:?}",
                self.placeholder.id,
                self.state
            );
            return Applied::Discarded;
        }
        self.state = ExchangeState::Streaming;

        match frame {
            ProtocolFrame::PartialReasoning(text) => {
                self.placeholder
                    .reasoning_trace
                    .get_or_insert_with(String::new)
                    .push_str(&text);
                Applied::Reasoning(text)
            }
            ProtocolFrame::Final(message) => {
                self.finalize(message);
                Applied::Finalized
            }
            ProtocolFrame::Error(detail) => {
                let text = format!("Error: {}", detail);
                self.terminate(ExchangeState::Failed, text.clone());
                Applied::Failed(text)
            }
        }
    }

    /// Records an adapter-level failure. A `Cancelled` error is treated as a
    /// cancellation. Returns false if the exchange had already terminated.
    pub fn fail(&mut self, error: &Error) -> bool {
        if error.is_cancelled() {
            return self.cancel();
        }
        if self.state.is_terminal() {
            return false;
        }
        self.terminate(ExchangeState::Failed, format!("Error: {}", error.summary()));
        true
    }

    /// Marks the exchange cancelled. Returns false if it had already terminated.
    pub fn cancel(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.terminate(ExchangeState::Cancelled, Error::Cancelled.summary());
        true
    }

    fn finalize(&mut self, message: FinalMessage) {
        let accumulated = self
            .placeholder
            .reasoning_trace
            .take()
            .filter(|trace| !trace.is_empty());
        let carried = message
            .reasoning_trace
            .filter(|trace| self.wants_reasoning_trace && !trace.trim().is_empty());

        let turn = &mut self.placeholder;
        turn.text = message.text;
        turn.source_label = message.source_label;
        turn.references = message.references;
        turn.reasoning_trace = carried.or(accumulated);
        turn.is_streaming = false;
        turn.outcome = Some(TurnOutcome::Completed);
        self.state = ExchangeState::Finalized;
    }

    fn terminate(&mut self, state: ExchangeState, text: String) {
        let turn = &mut self.placeholder;
        turn.text = text;
        turn.reasoning_trace = turn.reasoning_trace.take().filter(|t| !t.is_empty());
        turn.is_streaming = false;
        turn.outcome = Some(match state {
            ExchangeState::Cancelled => TurnOutcome::Cancelled,
            _ => TurnOutcome::Failed,
        });
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reference;
    use proptest::prelude::*;

    fn streaming_exchange() -> Exchange {
        Exchange::new(Message::placeholder(true))
    }

    #[test]
    fn test_new_exchange_is_pending() {
        let exchange = streaming_exchange();
        assert_eq!(exchange.state(), ExchangeState::Pending);
        assert!(exchange.message().is_streaming);
    }

    #[test]
    fn test_first_frame_enters_streaming() {
        let mut exchange = streaming_exchange();
        exchange.apply(ProtocolFrame::PartialReasoning("a".into()));
        assert_eq!(exchange.state(), ExchangeState::Streaming);
        assert_eq!(exchange.message().reasoning_trace.as_deref(), Some("a"));
        assert!(exchange.message().is_streaming);
    }

    #[test]
    fn test_final_replaces_display_fields() {
        let mut exchange = streaming_exchange();
        let id = exchange.id().clone();
        let applied = exchange.apply(ProtocolFrame::Final(FinalMessage {
            text: "Paris".into(),
            reasoning_trace: None,
            source_label: Some("agent-direct".into()),
            references: Some(vec![Reference::new(1, "atlas", "France ...")]),
        }));

        assert_eq!(applied, Applied::Finalized);
        assert_eq!(exchange.state(), ExchangeState::Finalized);
        let message = exchange.message();
        assert_eq!(message.id, id);
        assert_eq!(message.text, "Paris");
        assert_eq!(message.source_label.as_deref(), Some("agent-direct"));
        assert_eq!(message.references.as_ref().unwrap().len(), 1);
        assert!(!message.is_streaming);
        assert!(message.is_completed());
    }

    #[test]
    fn test_final_keeps_accumulated_trace_when_payload_has_none() {
        let mut exchange = streaming_exchange();
        exchange.apply(ProtocolFrame::PartialReasoning("first ".into()));
        exchange.apply(ProtocolFrame::PartialReasoning("second".into()));
        exchange.apply(ProtocolFrame::Final(FinalMessage::text("done")));
        assert_eq!(
            exchange.message().reasoning_trace.as_deref(),
            Some("first second")
        );
    }

    #[test]
    fn test_final_trace_replaces_accumulated_when_present() {
        let mut exchange = streaming_exchange();
        exchange.apply(ProtocolFrame::PartialReasoning("draft".into()));
        exchange.apply(ProtocolFrame::Final(FinalMessage {
            text: "done".into(),
            reasoning_trace: Some("full trace".into()),
            ..Default::default()
        }));
        assert_eq!(
            exchange.message().reasoning_trace.as_deref(),
            Some("full trace")
        );
    }

    #[test]
    fn test_buffered_exchange_has_no_trace() {
        let mut exchange = Exchange::new(Message::placeholder(false));
        exchange.apply(ProtocolFrame::Final(FinalMessage {
            text: "Paris is the capital of France.".into(),
            reasoning_trace: Some("ignored".into()),
            ..Default::default()
        }));
        assert_eq!(exchange.message().reasoning_trace, None);
        assert_eq!(exchange.message().text, "Paris is the capital of France.");
    }

    #[test]
    fn test_error_frame_fails_turn() {
        let mut exchange = streaming_exchange();
        let applied = exchange.apply(ProtocolFrame::Error("model overloaded".into()));
        assert_eq!(applied, Applied::Failed("Error: model overloaded".into()));
        assert_eq!(exchange.state(), ExchangeState::Failed);
        assert!(exchange.message().is_failed());
        assert!(!exchange.message().is_streaming);
    }

    #[test]
    fn test_adapter_failure_uses_summary() {
        let mut exchange = streaming_exchange();
        assert!(exchange.fail(&Error::status(500, "Internal Server Error")));
        assert_eq!(
            exchange.message().text,
            "Error: Request failed with status 500: Internal Server Error"
        );
        assert_eq!(exchange.state(), ExchangeState::Failed);
    }

    #[test]
    fn test_cancel_before_any_frame() {
        let mut exchange = streaming_exchange();
        assert!(exchange.cancel());
        assert_eq!(exchange.state(), ExchangeState::Cancelled);
        assert!(exchange.message().is_cancelled());
        assert!(!exchange.message().is_failed());
        assert_eq!(exchange.message().reasoning_trace, None);
    }

    #[test]
    fn test_cancelled_error_maps_to_cancel() {
        let mut exchange = streaming_exchange();
        assert!(exchange.fail(&Error::Cancelled));
        assert_eq!(exchange.state(), ExchangeState::Cancelled);
    }

    #[test]
    fn test_terminal_state_is_never_left() {
        let mut exchange = streaming_exchange();
        exchange.cancel();
        let snapshot = exchange.message().clone();

        assert_eq!(
            exchange.apply(ProtocolFrame::Final(FinalMessage::text("late"))),
            Applied::Discarded
        );
        assert_eq!(
            exchange.apply(ProtocolFrame::PartialReasoning("late".into())),
            Applied::Discarded
        );
        assert!(!exchange.fail(&Error::protocol("late")));
        assert!(!exchange.cancel());
        assert_eq!(exchange.state(), ExchangeState::Cancelled);
        assert_eq!(exchange.message(), &snapshot);
    }

    proptest! {
        #[test]
        fn prop_trace_is_concatenation_in_arrival_order(
            parts in proptest::collection::vec("[a-z ]{0,8}", 0..12),
        ) {
            let mut exchange = streaming_exchange();
            for part in &parts {
                exchange.apply(ProtocolFrame::PartialReasoning(part.clone()));
            }
            exchange.apply(ProtocolFrame::Final(FinalMessage::text("done")));

            let expected: String = parts.concat();
            let trace = exchange.message().reasoning_trace.clone().unwrap_or_default();
            prop_assert_eq!(trace, expected);
            prop_assert_eq!(exchange.state(), ExchangeState::Finalized);
        }

        #[test]
        fn prop_only_first_terminal_frame_counts(
            first_is_final in any::<bool>(),
            extra in proptest::collection::vec("[a-z]{1,5}", 0..5),
        ) {
            let mut exchange = streaming_exchange();
            let first = if first_is_final {
                ProtocolFrame::Final(FinalMessage::text("answer"))
            } else {
                ProtocolFrame::Error("broken".into())
            };
            exchange.apply(first);
            let snapshot = exchange.message().clone();

            for text in extra {
                prop_assert_eq!(
                    exchange.apply(ProtocolFrame::Final(FinalMessage::text(text))),
                    Applied::Discarded
                );
            }
            prop_assert_eq!(exchange.message(), &snapshot);
        }
    }
}
