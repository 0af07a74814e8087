//! In-memory conversation log
//!
//! Each conversation keeps its most recent `max_history` messages. The log
//! is rendered into a plain-text preamble that is prepended to follow-up
//! prompts.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default messages kept per conversation
pub const DEFAULT_MAX_HISTORY: usize = 20;

/// Who wrote a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The person asking
    User,
    /// A model answer
    Assistant,
}

/// One logged message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Author
    pub role: Role,
    /// Message text
    pub content: String,
    /// Model that produced an assistant message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When the message was logged
    pub timestamp: DateTime<Utc>,
}

/// Per-conversation append log
#[derive(Debug)]
pub struct ConversationMemory {
    max_history: usize,
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl ConversationMemory {
    /// Create a log keeping `max_history` messages per conversation
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history,
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Append a message, dropping the oldest beyond `max_history`
    pub fn add_message(&self, conversation_id: &str, role: Role, content: impl Into<String>, model: Option<&str>) {
        let mut conversations = self.conversations.write();
        let history = conversations.entry(conversation_id.to_string()).or_default();
        history.push(Message {
            role,
            content: content.into(),
            model: model.map(str::to_string),
            timestamp: Utc::now(),
        });
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
    }

    /// Full history of a conversation
    #[must_use]
    pub fn history(&self, conversation_id: &str) -> Vec<Message> {
        self.conversations
            .read()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Render the last `max_messages` (or all) messages as prompt context
    ///
    /// Returns an empty string for an unknown or empty conversation.
    #[must_use]
    pub fn context_for_prompt(&self, conversation_id: &str, max_messages: Option<usize>) -> String {
        let conversations = self.conversations.read();
        let Some(history) = conversations.get(conversation_id).filter(|h| !h.is_empty()) else {
            return String::new();
        };

        let start = max_messages.map_or(0, |n| history.len().saturating_sub(n));
        let mut context = String::from("Previous conversation:\n\n");
        for message in &history[start..] {
            let role = match message.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            match &message.model {
                Some(model) => context.push_str(&format!("{role} ({model}): {}\n\n", message.content)),
                None => context.push_str(&format!("{role}: {}\n\n", message.content)),
            }
        }
        context
    }

    /// Empty a conversation's log
    pub fn clear(&self, conversation_id: &str) {
        if let Some(history) = self.conversations.write().get_mut(conversation_id) {
            history.clear();
        }
    }

    /// Known conversation ids
    #[must_use]
    pub fn conversation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.conversations.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_context_format() {
        let memory = ConversationMemory::default();
        memory.add_message("c", Role::User, "What is Rust?", None);
        memory.add_message("c", Role::Assistant, "A language.", Some("llama"));

        assert_eq!(
            memory.context_for_prompt("c", None),
            "Previous conversation:\n\nUser: What is Rust?\n\nAssistant (llama): A language.\n\n"
        );
    }

    #[test]
    fn test_unknown_conversation_is_empty() {
        let memory = ConversationMemory::default();
        assert_eq!(memory.context_for_prompt("nope", None), "");
        assert!(memory.history("nope").is_empty());
    }

    #[test]
    fn test_history_trimmed() {
        let memory = ConversationMemory::new(3);
        for i in 0..5 {
            memory.add_message("c", Role::User, format!("m{i}"), None);
        }
        let contents: Vec<_> = memory.history("c").into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_context_limit_and_clear() {
        let memory = ConversationMemory::default();
        memory.add_message("c", Role::User, "first", None);
        memory.add_message("c", Role::User, "second", None);

        assert_eq!(
            memory.context_for_prompt("c", Some(1)),
            "Previous conversation:\n\nUser: second\n\n"
        );

        memory.clear("c");
        assert_eq!(memory.context_for_prompt("c", None), "");
        assert_eq!(memory.conversation_ids(), vec!["c".to_string()]);
    }
}
