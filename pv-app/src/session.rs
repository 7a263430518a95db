//! Per-conversation chat history, held in memory.

use dashmap::DashMap;
use pv_channels::ConversationKey;
use pv_llm::{ChatMessage, Usage};

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub history: Vec<ChatMessage>,
    pub usage_totals: Usage,
}

impl Session {
    pub fn reset(&mut self) {
        self.history.clear();
        self.usage_totals = Usage::default();
    }
}

pub struct SessionManager {
    sessions: DashMap<ConversationKey, Session>,
    history_max_messages: usize,
}

impl SessionManager {
    pub fn new(history_max_messages: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            history_max_messages,
        }
    }

    /// History to send ahead of a new user message, oldest first.
    pub fn history(&self, key: &ConversationKey) -> Vec<ChatMessage> {
        self.sessions
            .get(key)
            .map(|session| session.history.clone())
            .unwrap_or_default()
    }

    pub fn history_len(&self, key: &ConversationKey) -> usize {
        self.sessions
            .get(key)
            .map(|session| session.history.len())
            .unwrap_or(0)
    }

    /// Records one completed exchange and trims the oldest messages past the limit.
    pub fn append_exchange(&self, key: &ConversationKey, user: &str, assistant: &str, usage: Usage) {
        let mut session = self.sessions.entry(key.clone()).or_default();
        session.history.push(ChatMessage::user(user));
        session.history.push(ChatMessage::assistant(assistant));
        let overflow = session.history.len().saturating_sub(self.history_max_messages);
        if overflow > 0 {
            session.history.drain(..overflow);
        }
        session.usage_totals.prompt_tokens += usage.prompt_tokens;
        session.usage_totals.completion_tokens += usage.completion_tokens;
    }

    pub fn usage(&self, key: &ConversationKey) -> Usage {
        self.sessions
            .get(key)
            .map(|session| session.usage_totals)
            .unwrap_or_default()
    }

    pub fn reset(&self, key: &ConversationKey) {
        if let Some(mut session) = self.sessions.get_mut(key) {
            session.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
