use crate::inference::{ChatTurn, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One entry of the conversation log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Ordered message log.
///
/// Messages are immutable once appended, except the most recent assistant message
/// which may be rewritten while it streams.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    messages: Vec<ChatMessage>,
}

impl Transcript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and return its position
    pub fn push(&mut self, role: Role, content: impl Into<String>) -> usize {
        self.messages.push(ChatMessage::new(role, content));
        self.messages.len() - 1
    }

    /// Replace the content of the streaming assistant message at `index`.
    ///
    /// Returns `false` and changes nothing if `index` is not the last message or is not an
    /// assistant message, which happens when the transcript was cleared mid-stream.
    pub fn replace_content(&mut self, index: usize, content: impl Into<String>) -> bool {
        let last = self.messages.len().checked_sub(1);
        match self.messages.get_mut(index) {
            Some(message) if Some(index) == last && message.role == Role::Assistant => {
                message.content = content.into();
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Role/content pairs of the first `end` messages
    #[must_use]
    pub fn history_before(&self, end: usize) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .take(end)
            .map(|m| ChatTurn::new(m.role, m.content.clone()))
            .collect()
    }
}
