use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "webchat", "wecom", "feishu".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message to a specific user/chat on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId>;

    /// Create a message that will later be edited in place.
    /// Adapters that cannot edit messages should keep the default.
    async fn create_placeholder(&self, _recipient_id: &str, _text: &str) -> Result<MessageId> {
        Err(anyhow::anyhow!(
            "create_placeholder is not supported by this channel"
        ))
    }

    /// Replace the full content of a previously sent message.
    async fn edit_message(
        &self,
        _recipient_id: &str,
        _message_id: &MessageId,
        _text: &str,
    ) -> Result<()> {
        Err(anyhow::anyhow!("edit_message is not supported by this channel"))
    }

    fn supports_message_edits(&self) -> bool {
        false
    }
}
