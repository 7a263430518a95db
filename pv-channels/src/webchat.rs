use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, MessageId, OutboundMessage};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WEBCHAT_CHANNEL: &str = "webchat";

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

/// Browser chat over a WebSocket. One connection is one conversation.
#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    fn push_frame(&self, recipient_id: &str, frame: serde_json::Value) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(anyhow::anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        conn.send(Message::Text(frame.to_string().into()))
            .map_err(|_| anyhow::anyhow!("webchat send failed: socket closed"))
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

/// Extracts the text of an inbound `message` frame.
fn parse_inbound_frame(text: &str) -> Result<String> {
    let parsed: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| anyhow::anyhow!("webchat received invalid json: {e}"))?;
    let msg_type = parsed
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("webchat payload missing type"))?;
    if msg_type != "message" {
        return Err(anyhow::anyhow!(
            "webchat unsupported message type: {msg_type}"
        ));
    }
    parsed
        .get("content")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("webchat message missing content"))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let sender_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter
        .state
        .connections
        .insert(sender_id.clone(), outbound_tx);

    let hello = serde_json::json!({ "type": "hello", "sender_id": sender_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.state.connections.remove(&sender_id);
        return;
    }

    let adapter_out = adapter.clone();
    let sender_id_out = sender_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.state.connections.remove(&sender_id_out);
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let content = match parse_inbound_frame(&text) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(%e, sender_id = %sender_id, "webchat invalid payload");
                continue;
            }
        };

        let inbound = InboundMessage {
            message_id: Uuid::new_v4().to_string().into(),
            channel_id: WEBCHAT_CHANNEL.into(),
            account_id: crate::types::DEFAULT_ACCOUNT_ID.to_string(),
            sender_id: sender_id.clone().into(),
            chat_id: sender_id.clone().into(),
            is_group: false,
            content,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        };

        let tx = adapter.state.inbound_tx.read().await.clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(inbound).await {
                tracing::error!(%e, sender_id = %sender_id, "webchat inbound queue closed");
                break;
            }
        } else {
            tracing::error!(sender_id = %sender_id, "webchat adapter started without inbound queue");
            break;
        }
    }

    outbound_task.abort();
    adapter.state.connections.remove(&sender_id);
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        WEBCHAT_CHANNEL
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let id = MessageId::new(Uuid::new_v4().to_string());
        self.push_frame(
            recipient_id,
            serde_json::json!({
                "type": "message",
                "id": id,
                "content": message.content,
                "reply_to": message.reply_to_message_id,
            }),
        )?;
        Ok(id)
    }

    async fn create_placeholder(&self, recipient_id: &str, text: &str) -> Result<MessageId> {
        let id = MessageId::new(Uuid::new_v4().to_string());
        self.push_frame(
            recipient_id,
            serde_json::json!({ "type": "placeholder", "id": id, "content": text }),
        )?;
        Ok(id)
    }

    async fn edit_message(&self, recipient_id: &str, message_id: &MessageId, text: &str) -> Result<()> {
        self.push_frame(
            recipient_id,
            serde_json::json!({ "type": "edit", "id": message_id, "content": text }),
        )
    }

    fn supports_message_edits(&self) -> bool {
        true
    }
}
