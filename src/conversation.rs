//! Ordered, id-keyed message store for one conversation.
//!
//! Messages live in a map keyed by [`MessageId`] with a separate append-only
//! index recording their order. Replacing a placeholder is an O(1) keyed
//! update that never touches the order.

use crate::types::{HistoryTurn, Message, MessageId, Role};
use std::collections::HashMap;

/// Live message list of a conversation.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: HashMap<MessageId, Message>,
    order: Vec<MessageId>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.messages.contains_key(id)
    }

    /// Messages oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.order.iter().filter_map(|id| self.messages.get(id))
    }

    /// Owned snapshot, oldest first.
    pub fn to_vec(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Completed exchanges in backend history form.
    ///
    /// A user turn is forwarded only together with the completed answer that
    /// follows it, so user and model turns keep alternating.
    pub fn history(&self) -> Vec<HistoryTurn> {
        let messages: Vec<&Message> = self.iter().collect();
        let mut turns = Vec::with_capacity(messages.len());
        for (i, message) in messages.iter().enumerate() {
            if message.role == Role::User {
                let answered = messages.get(i + 1).is_some_and(|next| {
                    next.role == Role::Assistant && next.is_completed() && !next.is_streaming
                });
                if !answered {
                    continue;
                }
            }
            turns.extend(HistoryTurn::from_message(message));
        }
        turns
    }

    /// Appends the user turn and its assistant placeholder as the two newest
    /// entries. Earlier entries keep their positions.
    ///
    /// A message whose id is already present is not inserted twice.
    pub fn append_placeholder(&mut self, user: Message, placeholder: Message) {
        for message in [user, placeholder] {
            if self.messages.contains_key(&message.id) {
                log::warn!(
                    "Message {} already present in conversation; not appending again",
                    message.id
                );
                continue;
            }
            self.order.push(message.id.clone());
            self.messages.insert(message.id.clone(), message);
        }
    }

    /// Replaces the message stored under `id` with `update`.
    ///
    /// The stored id and creation timestamp are kept. Returns false and logs
    /// if no such message exists; nothing is inserted in that case.
    pub fn commit(&mut self, id: &MessageId, mut update: Message) -> bool {
        match self.messages.get_mut(id) {
            Some(existing) => {
                update.id = existing.id.clone();
                update.timestamp = existing.timestamp;
                *existing = update;
                true
            }
            None => {
                log::warn!(
                    "Inconsistent commit: no message with id {} in conversation",
                    id
                );
                false
            }
        }
    }

    /// Appends a reasoning delta to the trace of the message under `id`.
    ///
    /// Returns false and logs if no such message exists.
    pub fn append_trace(&mut self, id: &MessageId, delta: &str) -> bool {
        match self.messages.get_mut(id) {
            Some(message) => {
                message
                    .reasoning_trace
                    .get_or_insert_with(String::new)
                    .push_str(delta);
                true
            }
            None => {
                log::warn!("Reasoning delta for unknown message {} dropped", id);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnOutcome;

    fn finalized(mut placeholder: Message, text: &str) -> Message {
        placeholder.text = text.to_string();
        placeholder.is_streaming = false;
        placeholder.outcome = Some(TurnOutcome::Completed);
        placeholder
    }

    #[test]
    fn test_append_placeholder_adds_pair_at_end() {
        let mut conversation = Conversation::new();
        conversation.append_placeholder(Message::user("first"), Message::placeholder(false));
        conversation.append_placeholder(Message::user("second"), Message::placeholder(false));

        let messages = conversation.to_vec();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].text, "first");
        assert_eq!(messages[2].text, "second");
        assert_eq!(messages[3].role, Role::Assistant);
        assert!(messages[3].is_streaming);
    }

    #[test]
    fn test_commit_replaces_in_place() {
        let mut conversation = Conversation::new();
        let placeholder = Message::placeholder(false);
        let id = placeholder.id.clone();
        let created = placeholder.timestamp;
        conversation.append_placeholder(Message::user("q"), placeholder.clone());
        conversation.append_placeholder(Message::user("q2"), Message::placeholder(false));

        assert!(conversation.commit(&id, finalized(placeholder, "answer")));

        let messages = conversation.to_vec();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].id, id);
        assert_eq!(messages[1].text, "answer");
        assert_eq!(messages[1].timestamp, created);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let mut conversation = Conversation::new();
        let placeholder = Message::placeholder(false);
        let id = placeholder.id.clone();
        conversation.append_placeholder(Message::user("q"), placeholder.clone());

        let done = finalized(placeholder, "answer");
        conversation.commit(&id, done.clone());
        let once = conversation.to_vec();
        conversation.commit(&id, done);
        assert_eq!(conversation.to_vec(), once);
    }

    #[test]
    fn test_commit_unknown_id_is_noop() {
        let mut conversation = Conversation::new();
        conversation.append_placeholder(Message::user("q"), Message::placeholder(false));
        let stray = Message::placeholder(false);
        assert!(!conversation.commit(&stray.id.clone(), stray));
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn test_commit_keeps_original_id_and_timestamp() {
        let mut conversation = Conversation::new();
        let placeholder = Message::placeholder(false);
        let id = placeholder.id.clone();
        let created = placeholder.timestamp;
        conversation.append_placeholder(Message::user("q"), placeholder);

        let impostor = finalized(Message::placeholder(false), "answer");
        assert!(conversation.commit(&id, impostor));
        let stored = conversation.get(&id).unwrap();
        assert_eq!(stored.id, id);
        assert_eq!(stored.timestamp, created);
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn test_duplicate_append_is_ignored() {
        let mut conversation = Conversation::new();
        let user = Message::user("q");
        let placeholder = Message::placeholder(false);
        conversation.append_placeholder(user.clone(), placeholder.clone());
        conversation.append_placeholder(user, placeholder);
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn test_history_only_includes_completed_turns() {
        let mut conversation = Conversation::new();
        let placeholder = Message::placeholder(false);
        let id = placeholder.id.clone();
        conversation.append_placeholder(Message::user("q"), placeholder.clone());
        assert!(conversation.history().is_empty());

        conversation.commit(&id, finalized(placeholder, "a"));
        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].role, "model");
    }

    #[test]
    fn test_history_skips_unanswered_question() {
        let mut conversation = Conversation::new();
        let mut failed = Message::placeholder(false);
        failed.text = "Error: connection reset".to_string();
        failed.is_streaming = false;
        failed.outcome = Some(TurnOutcome::Failed);
        conversation.append_placeholder(Message::user("lost"), failed);

        let placeholder = Message::placeholder(false);
        let id = placeholder.id.clone();
        conversation.append_placeholder(Message::user("kept"), placeholder.clone());
        conversation.commit(&id, finalized(placeholder, "answer"));

        let history = conversation.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].parts[0].text, "kept");
        assert_eq!(history[1].parts[0].text, "answer");
    }

    #[test]
    fn test_append_trace_extends_stored_placeholder() {
        let mut conversation = Conversation::new();
        let placeholder = Message::placeholder(true);
        let id = placeholder.id.clone();
        conversation.append_placeholder(Message::user("q"), placeholder);

        assert!(conversation.append_trace(&id, "First, "));
        assert!(conversation.append_trace(&id, "then."));

        let stored = conversation.get(&id).unwrap();
        assert_eq!(stored.reasoning_trace.as_deref(), Some("First, then."));
        assert!(stored.is_streaming);
        assert_eq!(conversation.len(), 2);
    }

    #[test]
    fn test_append_trace_unknown_id_is_noop() {
        let mut conversation = Conversation::new();
        conversation.append_placeholder(Message::user("q"), Message::placeholder(true));
        let stray = Message::placeholder(true);
        assert!(!conversation.append_trace(&stray.id, "lost"));
        assert!(conversation.iter().all(|m| m.reasoning_trace.as_deref() != Some("lost")));
    }
}
