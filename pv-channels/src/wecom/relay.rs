use super::{WecomTarget, WecomTextMessage};
use crate::types::InboundMessage;
use anyhow::{Result, anyhow};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const SEND_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RelayMessage {
    msg_type: String,
    from_user: String,
    #[serde(default)]
    to_user: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    msg_id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    create_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResult {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msgid: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug)]
enum RelayFrame {
    Connected(Option<String>),
    Pong,
    Message(RelayMessage),
    SendResult(SendResult),
    Unknown(String),
}

fn parse_frame(text: &str) -> Result<RelayFrame> {
    let value: Value = serde_json::from_str(text)?;
    let frame_type = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("wecom relay frame missing type"))?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Ok(match frame_type {
        "connected" => RelayFrame::Connected(
            data.get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        ),
        "pong" => RelayFrame::Pong,
        "message" => RelayFrame::Message(serde_json::from_value(data)?),
        "send_result" => RelayFrame::SendResult(serde_json::from_value(data)?),
        other => RelayFrame::Unknown(other.to_string()),
    })
}

fn relay_target(target: &WecomTarget) -> String {
    match target {
        WecomTarget::User(id) => format!("user:{id}"),
        WecomTarget::Chat(id) => format!("chat:{id}"),
    }
}

/// Client side of the WeCom relay socket. Reconnects until the inbound queue closes.
pub struct RelayClient {
    url: String,
    outbound: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    pending: DashMap<String, oneshot::Sender<SendResult>>,
}

impl RelayClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim().to_string(),
            outbound: RwLock::new(None),
            pending: DashMap::new(),
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(url = %self.url))]
    pub async fn run(&self, account_id: String, tx: mpsc::Sender<InboundMessage>) {
        loop {
            match self.run_once(&account_id, &tx).await {
                Ok(()) => tracing::warn!("wecom relay connection closed"),
                Err(e) => tracing::warn!(%e, "wecom relay connection failed"),
            }
            *self.outbound.write().await = None;
            // Dropping the senders fails every in-flight send immediately.
            self.pending.clear();
            if tx.is_closed() {
                break;
            }
            tracing::info!(delay_secs = RECONNECT_DELAY.as_secs(), "wecom relay reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
        }
    }

    async fn run_once(&self, account_id: &str, tx: &mpsc::Sender<InboundMessage>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        tracing::info!("wecom relay connected");
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.write().await = Some(out_tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
        });
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let ping = json!({ "type": "ping" }).to_string();
                if out_tx.send(Message::Text(ping.into())).is_err() {
                    break;
                }
            }
        });

        let result = self.read_loop(&mut read, account_id, tx).await;
        writer.abort();
        heartbeat.abort();
        result
    }

    async fn read_loop<S>(
        &self,
        read: &mut S,
        account_id: &str,
        tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<()>
    where
        S: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = read.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(_) => return Ok(()),
                _ => continue,
            };
            let frame = match parse_frame(&text) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(%e, "wecom relay frame unreadable");
                    continue;
                }
            };
            match frame {
                RelayFrame::Connected(message) => {
                    tracing::info!(message = ?message, "wecom relay handshake");
                }
                RelayFrame::Pong => {}
                RelayFrame::Message(message) => {
                    if message.msg_type != "text" || message.content.trim().is_empty() {
                        continue;
                    }
                    let inbound = WecomTextMessage {
                        from_user: message.from_user,
                        to_user: message.to_user,
                        content: message.content,
                        msg_id: message.msg_id,
                        agent_id: message.agent_id,
                        create_time: message
                            .create_time
                            .and_then(|value| value.trim().parse::<i64>().ok()),
                    }
                    .into_inbound(account_id);
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow!("wecom inbound queue closed: {e}"))?;
                }
                RelayFrame::SendResult(result) => {
                    match self.pending.remove(&result.request_id) {
                        Some((_, waiter)) => {
                            let _ = waiter.send(result);
                        }
                        None => tracing::debug!(request_id = %result.request_id, "wecom relay result without waiter"),
                    }
                }
                RelayFrame::Unknown(kind) => tracing::debug!(%kind, "wecom relay frame ignored"),
            }
        }
        Ok(())
    }

    /// Asks the relay to send a text message and waits for its `send_result`.
    pub async fn send(&self, target: &WecomTarget, content: &str) -> Result<Option<String>> {
        let outbound = self
            .outbound
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow!("wecom relay not connected"))?;

        let request_id = Uuid::new_v4().to_string();
        let (waiter_tx, waiter_rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), waiter_tx);

        let frame = json!({
            "type": "send_message",
            "data": { "to": relay_target(target), "content": content, "requestId": request_id },
        });
        if outbound
            .send(Message::Text(frame.to_string().into()))
            .is_err()
        {
            self.pending.remove(&request_id);
            return Err(anyhow!("wecom relay send failed: socket closed"));
        }

        let result = match tokio::time::timeout(SEND_TIMEOUT, waiter_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(anyhow!("wecom relay disconnected before send_result")),
            Err(_) => {
                self.pending.remove(&request_id);
                return Err(anyhow!("wecom relay send timed out"));
            }
        };
        if !result.success {
            return Err(anyhow!(
                "wecom relay send failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            ));
        }
        Ok(result.msgid)
    }
}
