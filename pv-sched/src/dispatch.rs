//! Turn dispatcher: runs the reply engine for one active turn and delivers its output.

use crate::chunk::chunk_text;
use crate::config::{EMPTY_REPLY_TEXT, SchedulerConfig};
use crate::error::Result;
use crate::event::CoalescedTurn;
use crate::throttle::StreamThrottle;
use crate::traits::{OutboundTransport, ReplyEngine, TurnHandler};
use async_trait::async_trait;
use futures_util::StreamExt;
use pv_channels::{ConversationKey, MessageId};
use std::sync::Arc;

/// How a turn's reply reaches the user. Chosen once, before the engine runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Edit this placeholder in place as text streams in.
    Streaming(MessageId),
    /// Send the final text once, split into chunks.
    Chunked,
}

pub struct TurnDispatcher {
    config: Arc<SchedulerConfig>,
    engine: Arc<dyn ReplyEngine>,
    transport: Arc<dyn OutboundTransport>,
}

impl TurnDispatcher {
    pub fn new(
        config: Arc<SchedulerConfig>,
        engine: Arc<dyn ReplyEngine>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Self {
        Self {
            config,
            engine,
            transport,
        }
    }

    async fn choose_mode(&self, key: &ConversationKey) -> DeliveryMode {
        if !self.transport.supports_placeholder(key) {
            return DeliveryMode::Chunked;
        }
        match self.transport.create_placeholder(key).await {
            Ok(id) => DeliveryMode::Streaming(id),
            Err(e) => {
                tracing::warn!(conversation_key = %key, %e, "placeholder failed; using chunked delivery");
                DeliveryMode::Chunked
            }
        }
    }

    async fn collect_reply(
        &self,
        turn: &CoalescedTurn,
        throttle: Option<&StreamThrottle>,
        reply: &mut String,
    ) -> Result<()> {
        let mut stream = self.engine.invoke(turn).await?;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.delta.is_empty() {
                continue;
            }
            reply.push_str(&chunk.delta);
            if let Some(throttle) = throttle {
                throttle.on_partial(reply).await;
            }
        }
        Ok(())
    }

    /// Sends `text` in chunks; the first one replies to the turn's anchor message.
    async fn send_chunked(&self, turn: &CoalescedTurn, text: &str) {
        let key = &turn.conversation_key;
        let limit = self.config.chunk_limit_for(key);
        for (idx, chunk) in chunk_text(text, limit).iter().enumerate() {
            let reply_to = (idx == 0).then_some(&turn.anchor_message_id);
            if let Err(e) = self.transport.send_direct(key, chunk, reply_to).await {
                tracing::warn!(conversation_key = %key, chunk = idx, %e, "reply chunk delivery failed");
            }
        }
    }
}

#[async_trait]
impl TurnHandler for TurnDispatcher {
    #[tracing::instrument(level = "debug", skip_all, fields(conversation_key = %turn.conversation_key))]
    async fn handle(&self, turn: CoalescedTurn) -> Result<()> {
        let key = turn.conversation_key.clone();
        let mode = self.choose_mode(&key).await;
        let throttle = match &mode {
            DeliveryMode::Streaming(id) => Some(StreamThrottle::new(
                Arc::clone(&self.transport),
                key.clone(),
                id.clone(),
                self.config.update_interval,
            )),
            DeliveryMode::Chunked => None,
        };

        let mut reply = String::new();
        let outcome = self
            .collect_reply(&turn, throttle.as_ref(), &mut reply)
            .await;

        match (outcome, throttle) {
            (Ok(()), Some(throttle)) => {
                let text = if reply.trim().is_empty() {
                    EMPTY_REPLY_TEXT
                } else {
                    reply.as_str()
                };
                throttle.on_complete(Some(text)).await;
                tracing::debug!(
                    placeholder_id = %throttle.placeholder_id(),
                    reply_chars = reply.chars().count(),
                    "streamed reply delivered"
                );
                Ok(())
            }
            (Ok(()), None) => {
                self.send_chunked(&turn, &reply).await;
                tracing::debug!(reply_chars = reply.chars().count(), "chunked reply delivered");
                Ok(())
            }
            (Err(e), throttle) => {
                tracing::error!(conversation_key = %key, %e, "reply engine failed");
                let notice = self.config.failure_notice.as_str();
                match throttle {
                    Some(throttle) => {
                        let text = if reply.trim().is_empty() {
                            notice.to_string()
                        } else {
                            format!("{reply}\n\n{notice}")
                        };
                        throttle.on_complete(Some(&text)).await;
                    }
                    None => {
                        if let Err(send_err) = self
                            .transport
                            .send_direct(&key, notice, Some(&turn.anchor_message_id))
                            .await
                        {
                            tracing::warn!(conversation_key = %key, %send_err, "failure notice delivery failed");
                        }
                    }
                }
                Err(e)
            }
        }
    }
}
