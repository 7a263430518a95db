//! Routes scheduler deliveries to the adapter that owns the conversation's channel.

use async_trait::async_trait;
use pv_channels::{ChannelAdapter, ConversationKey, MessageId, OutboundMessage};
use pv_sched::{Notifier, OutboundTransport, PLACEHOLDER_TEXT, SchedError};
use std::collections::HashMap;
use std::sync::Arc;

pub struct ChannelOutbound {
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
}

impl ChannelOutbound {
    pub fn new(channels: HashMap<String, Arc<dyn ChannelAdapter>>) -> Self {
        Self { channels }
    }

    fn adapter(&self, key: &ConversationKey) -> pv_sched::Result<&Arc<dyn ChannelAdapter>> {
        self.channels
            .get(key.channel().as_str())
            .ok_or_else(|| SchedError::delivery(format!("unknown channel: {}", key.channel())))
    }
}

#[async_trait]
impl OutboundTransport for ChannelOutbound {
    fn supports_placeholder(&self, key: &ConversationKey) -> bool {
        self.channels
            .get(key.channel().as_str())
            .is_some_and(|adapter| adapter.supports_message_edits())
    }

    async fn create_placeholder(&self, key: &ConversationKey) -> pv_sched::Result<MessageId> {
        self.adapter(key)?
            .create_placeholder(key.chat(), PLACEHOLDER_TEXT)
            .await
            .map_err(SchedError::delivery)
    }

    async fn edit_placeholder(
        &self,
        key: &ConversationKey,
        placeholder_id: &MessageId,
        text: &str,
    ) -> pv_sched::Result<()> {
        self.adapter(key)?
            .edit_message(key.chat(), placeholder_id, text)
            .await
            .map_err(SchedError::delivery)
    }

    async fn send_direct(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&MessageId>,
    ) -> pv_sched::Result<MessageId> {
        let message = OutboundMessage {
            content: text.to_string(),
            reply_to_message_id: reply_to.cloned(),
        };
        self.adapter(key)?
            .send(key.chat(), message)
            .await
            .map_err(SchedError::delivery)
    }
}

#[async_trait]
impl Notifier for ChannelOutbound {
    async fn notify(&self, key: &ConversationKey, text: &str) -> pv_sched::Result<()> {
        self.adapter(key)?
            .send(key.chat(), OutboundMessage::text(text))
            .await
            .map(|_| ())
            .map_err(SchedError::delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pv_channels::InboundMessage;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeAdapter {
        editable: bool,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelAdapter for FakeAdapter {
        fn channel_id(&self) -> &str {
            "fake"
        }

        async fn start(&self, _tx: mpsc::Sender<InboundMessage>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn send(
            &self,
            recipient_id: &str,
            message: OutboundMessage,
        ) -> anyhow::Result<MessageId> {
            self.calls.lock().expect("calls lock").push(format!(
                "send {recipient_id} {} reply_to={:?}",
                message.content,
                message.reply_to_message_id.as_deref()
            ));
            Ok(MessageId::new("sent-1"))
        }

        async fn create_placeholder(
            &self,
            recipient_id: &str,
            text: &str,
        ) -> anyhow::Result<MessageId> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(format!("placeholder {recipient_id} {text}"));
            Ok(MessageId::new("ph-1"))
        }

        fn supports_message_edits(&self) -> bool {
            self.editable
        }
    }

    fn outbound(adapter: Arc<FakeAdapter>) -> ChannelOutbound {
        let adapter: Arc<dyn ChannelAdapter> = adapter;
        ChannelOutbound::new(HashMap::from([("fake".to_string(), adapter)]))
    }

    fn key(channel: &str) -> ConversationKey {
        ConversationKey::new(channel, "default", "chat-1", "user-1").expect("valid key")
    }

    #[tokio::test]
    async fn routes_to_chat_of_the_conversation() {
        let adapter = Arc::new(FakeAdapter {
            editable: true,
            ..FakeAdapter::default()
        });
        let outbound = outbound(adapter.clone());

        assert!(outbound.supports_placeholder(&key("fake")));
        let id = outbound
            .create_placeholder(&key("fake"))
            .await
            .expect("placeholder");
        assert_eq!(id.as_str(), "ph-1");
        outbound
            .send_direct(&key("fake"), "hello", Some(&MessageId::new("m9")))
            .await
            .expect("send");
        outbound.notify(&key("fake"), "queued").await.expect("notify");

        let calls = adapter.calls.lock().expect("calls lock").clone();
        assert_eq!(
            calls,
            vec![
                format!("placeholder chat-1 {PLACEHOLDER_TEXT}"),
                "send chat-1 hello reply_to=Some(\"m9\")".to_string(),
                "send chat-1 queued reply_to=None".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn unknown_channel_and_missing_edit_support_are_delivery_errors() {
        let outbound = outbound(Arc::new(FakeAdapter::default()));
        assert!(!outbound.supports_placeholder(&key("fake")));
        assert!(!outbound.supports_placeholder(&key("other")));

        let err = outbound
            .send_direct(&key("other"), "hi", None)
            .await
            .expect_err("unknown channel");
        assert!(matches!(err, SchedError::Delivery(_)));

        let err = outbound
            .edit_placeholder(&key("fake"), &MessageId::new("x"), "text")
            .await
            .expect_err("edits unsupported");
        assert!(matches!(err, SchedError::Delivery(_)));
    }
}
