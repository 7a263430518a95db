//! Scheduler collaborators shared by the app's unit tests.

use async_trait::async_trait;
use pv_channels::{ConversationKey, MessageId};
use pv_sched::{
    CoalescedTurn, Notifier, OutboundTransport, ReplyChunk, ReplyEngine, ReplyStream, SchedError,
};
use std::sync::Mutex;

/// Replies with the merged text it received.
pub struct EchoEngine;

#[async_trait]
impl ReplyEngine for EchoEngine {
    async fn invoke(&self, turn: &CoalescedTurn) -> pv_sched::Result<ReplyStream> {
        let text = format!("echo: {}", turn.merged_text);
        Ok(Box::pin(futures_util::stream::once(async move {
            Ok::<_, SchedError>(ReplyChunk::new(text))
        })))
    }
}

/// Non-editable transport that records `(chat, text)` for every direct send.
#[derive(Default)]
pub struct SentLog(Mutex<Vec<(String, String)>>);

impl SentLog {
    pub fn sent(&self) -> Vec<(String, String)> {
        self.0.lock().expect("log lock").clone()
    }
}

#[async_trait]
impl OutboundTransport for SentLog {
    fn supports_placeholder(&self, _key: &ConversationKey) -> bool {
        false
    }

    async fn create_placeholder(&self, _key: &ConversationKey) -> pv_sched::Result<MessageId> {
        Err(SchedError::delivery("not editable"))
    }

    async fn edit_placeholder(
        &self,
        _key: &ConversationKey,
        _placeholder_id: &MessageId,
        _text: &str,
    ) -> pv_sched::Result<()> {
        Err(SchedError::delivery("not editable"))
    }

    async fn send_direct(
        &self,
        key: &ConversationKey,
        text: &str,
        _reply_to: Option<&MessageId>,
    ) -> pv_sched::Result<MessageId> {
        self.0
            .lock()
            .expect("log lock")
            .push((key.chat().to_string(), text.to_string()));
        Ok(MessageId::new("out"))
    }
}

#[async_trait]
impl Notifier for SentLog {
    async fn notify(&self, _key: &ConversationKey, _text: &str) -> pv_sched::Result<()> {
        Ok(())
    }
}
