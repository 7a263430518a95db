use crate::error::Result;
use crate::event::CoalescedTurn;
use async_trait::async_trait;
use futures_util::Stream;
use pv_channels::{ConversationKey, MessageId};
use std::pin::Pin;

/// One incremental piece of reply text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyChunk {
    pub delta: String,
}

impl ReplyChunk {
    pub fn new(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
        }
    }
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyChunk>> + Send>>;

/// Turns a coalesced turn into reply text.
///
/// The stream ends on success; an `Err` item (or an `Err` from `invoke`) is a dispatch fault.
#[async_trait]
pub trait ReplyEngine: Send + Sync {
    async fn invoke(&self, turn: &CoalescedTurn) -> Result<ReplyStream>;
}

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Whether the conversation's channel can edit a message in place.
    fn supports_placeholder(&self, key: &ConversationKey) -> bool;

    async fn create_placeholder(&self, key: &ConversationKey) -> Result<MessageId>;

    async fn edit_placeholder(
        &self,
        key: &ConversationKey,
        placeholder_id: &MessageId,
        text: &str,
    ) -> Result<()>;

    async fn send_direct(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId>;
}

/// Side channel for scheduler notices (currently only "queued").
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, key: &ConversationKey, text: &str) -> Result<()>;
}

/// Runs one active turn to completion. Implemented by the turn dispatcher.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle(&self, turn: CoalescedTurn) -> Result<()>;
}

/// Receives turns as debounce windows close.
pub trait TurnSink: Send + Sync {
    fn submit(&self, turn: CoalescedTurn) -> Result<()>;
}
