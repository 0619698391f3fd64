//! Per-agent chat history sent to the provider on every turn.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// System prompt plus a sliding window of the most recent turns.
///
/// A window of `n` keeps at most `2n` messages after the system prompt, so
/// prompts do not grow without bound over a long competition.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Conversation {
    system: Option<ChatMessage>,
    turns: Vec<ChatMessage>,
    window: usize,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>, window: usize) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            system: (!system_prompt.is_empty()).then(|| ChatMessage::system(system_prompt)),
            turns: Vec::new(),
            window,
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.turns.push(ChatMessage::user(content));
        self.truncate();
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.turns.push(ChatMessage::assistant(content));
        self.truncate();
    }

    fn truncate(&mut self) {
        let keep = self.window.saturating_mul(2);
        if self.turns.len() > keep {
            let excess = self.turns.len() - keep;
            self.turns.drain(..excess);
        }
    }

    /// Full message list in send order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.system
            .iter()
            .chain(self.turns.iter())
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.turns.last()
    }

    /// Number of messages after the system prompt.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_system_prompt() {
        let mut conv = Conversation::new("rules", 2);
        for i in 0..5 {
            conv.push_user(format!("q{i}"));
            conv.push_assistant(format!("a{i}"));
        }
        let messages = conv.messages();
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0], ChatMessage::system("rules"));
        assert_eq!(messages[1], ChatMessage::user("q3"));
        assert_eq!(messages[4], ChatMessage::assistant("a4"));
    }

    #[test]
    fn empty_system_prompt_omitted() {
        let mut conv = Conversation::new("", 10);
        conv.push_user("hello");
        assert_eq!(conv.messages(), vec![ChatMessage::user("hello")]);
    }

    #[test]
    fn serializes_as_chat_messages() {
        let value = serde_json::to_value(ChatMessage::assistant("ok")).unwrap();
        assert_eq!(value, serde_json::json!({"role": "assistant", "content": "ok"}));
    }
}
