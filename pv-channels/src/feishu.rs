//! Feishu (Lark) adapter: event callback inbound, Open API outbound.
//!
//! Replies stream into an interactive card that is patched in place.

use crate::traits::ChannelAdapter;
use crate::types::{DEFAULT_ACCOUNT_ID, InboundMessage, MessageId, OutboundMessage};
use anyhow::{Result, anyhow};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;

pub const FEISHU_CHANNEL: &str = "feishu";
pub const DEFAULT_FEISHU_API_BASE_URL: &str = "https://open.feishu.cn";

const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const RECENT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct FeishuConfig {
    pub account_id: String,
    pub app_id: String,
    pub app_secret: String,
    /// Compared against the `token` of incoming events when non-empty.
    pub verification_token: String,
    pub api_base_url: String,
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            app_id: String::new(),
            app_secret: String::new(),
            verification_token: String::new(),
            api_base_url: DEFAULT_FEISHU_API_BASE_URL.to_string(),
        }
    }
}

/// Bounded set of recently seen event ids. Feishu redelivers events it considers unacknowledged.
struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if `id` was already recorded.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct FeishuAdapter {
    config: FeishuConfig,
    http: reqwest::Client,
    token: tokio::sync::Mutex<Option<CachedToken>>,
    inbound_tx: RwLock<Option<mpsc::Sender<InboundMessage>>>,
    recent_events: Mutex<RecentIds>,
}

impl FeishuAdapter {
    pub fn new(config: FeishuConfig) -> Result<Self> {
        if config.app_id.trim().is_empty() {
            return Err(anyhow!("feishu app_id missing"));
        }
        if config.app_secret.trim().is_empty() {
            return Err(anyhow!("feishu app_secret missing"));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            http,
            token: tokio::sync::Mutex::new(None),
            inbound_tx: RwLock::new(None),
            recent_events: Mutex::new(RecentIds::new(RECENT_EVENT_CAPACITY)),
        })
    }

    /// Router that serves the event callback at `/feishu/events`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/feishu/events", post(receive_event))
            .with_state(self)
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/open-apis{path}",
            self.config.api_base_url.trim_end_matches('/')
        )
    }

    fn token_matches(&self, provided: Option<&str>) -> bool {
        let expected = self.config.verification_token.trim();
        expected.is_empty() || provided.map(str::trim) == Some(expected)
    }

    fn first_sighting(&self, event_id: &str) -> bool {
        self.recent_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(event_id)
    }

    async fn tenant_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let resp = self
            .http
            .post(self.api_url("/auth/v3/tenant_access_token/internal"))
            .json(&json!({ "app_id": self.config.app_id, "app_secret": self.config.app_secret }))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("feishu token failed: status={status} body={body}"));
        }
        let body: Value = resp.json().await?;
        check_code(&body, "feishu token failed")?;
        let value = body
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("feishu token missing tenant_access_token"))?
            .to_string();
        let expire = body.get("expire").and_then(Value::as_u64).unwrap_or(7200);
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now()
                + Duration::from_secs(expire).saturating_sub(TOKEN_REFRESH_MARGIN),
        });
        Ok(value)
    }

    /// Posts a message; replies in-thread when `reply_to` is given.
    async fn create_message(
        &self,
        recipient_id: &str,
        msg_type: &str,
        content: String,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId> {
        let token = self.tenant_token().await?;
        let request = match reply_to {
            Some(parent) => self
                .http
                .post(self.api_url(&format!("/im/v1/messages/{parent}/reply")))
                .json(&json!({ "msg_type": msg_type, "content": content })),
            None => {
                let (receive_id_type, receive_id) = receive_target(recipient_id);
                self.http
                    .post(self.api_url("/im/v1/messages"))
                    .query(&[("receive_id_type", receive_id_type)])
                    .json(&json!({
                        "receive_id": receive_id,
                        "msg_type": msg_type,
                        "content": content,
                    }))
            }
        };
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("feishu send failed: status={status} body={body}"));
        }
        check_code(&body, "feishu send failed")?;
        body.pointer("/data/message_id")
            .and_then(Value::as_str)
            .map(MessageId::from)
            .ok_or_else(|| anyhow!("feishu send response missing message_id"))
    }
}

/// `user:<open_id>` addresses a user; anything else is a chat id.
fn receive_target(recipient_id: &str) -> (&'static str, &str) {
    match recipient_id.strip_prefix("user:") {
        Some(open_id) => ("open_id", open_id),
        None => ("chat_id", recipient_id),
    }
}

fn card_content(text: &str) -> String {
    json!({
        "config": { "wide_screen_mode": true },
        "elements": [
            { "tag": "div", "text": { "tag": "lark_md", "content": text } }
        ],
    })
    .to_string()
}

fn check_code(body: &Value, context: &str) -> Result<()> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown");
    Err(anyhow!("{context}: {code} - {msg}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FeishuTextEvent {
    event_id: String,
    message_id: String,
    chat_id: String,
    sender_open_id: String,
    is_group: bool,
    text: String,
}

/// Drops `@_user_N` mention placeholders that Feishu inlines into group text.
/// Removes `@_user_N` placeholders (and the space after each) and leaves the rest as sent.
fn strip_mentions(text: &str) -> String {
    const MENTION: &str = "@_user_";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(MENTION) {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos + MENTION.len()..];
        let end = tail
            .find(|c: char| !c.is_ascii_alphanumeric())
            .unwrap_or(tail.len());
        rest = tail[end..].strip_prefix(' ').unwrap_or(&tail[end..]);
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Parses an `im.message.receive_v1` event. Other events and non-text messages yield `None`.
fn parse_message_event(payload: &Value) -> Result<Option<FeishuTextEvent>> {
    let event_type = payload
        .pointer("/header/event_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    if event_type != "im.message.receive_v1" {
        return Ok(None);
    }
    let event_id = payload
        .pointer("/header/event_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("invalid feishu event: missing header.event_id"))?;
    let sender_type = payload
        .pointer("/event/sender/sender_type")
        .and_then(Value::as_str)
        .unwrap_or("user");
    if sender_type != "user" {
        return Ok(None);
    }
    let message = payload
        .pointer("/event/message")
        .ok_or_else(|| anyhow!("invalid feishu event: missing event.message"))?;
    if message.get("message_type").and_then(Value::as_str) != Some("text") {
        return Ok(None);
    }

    let field = |name: &str| -> Result<String> {
        message
            .get(name)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("invalid feishu event: missing message.{name}"))
    };
    let content: Value = serde_json::from_str(&field("content")?)
        .map_err(|e| anyhow!("invalid feishu event: content is not json: {e}"))?;
    let text = content
        .get("text")
        .and_then(Value::as_str)
        .map(strip_mentions)
        .unwrap_or_default();
    let sender_open_id = payload
        .pointer("/event/sender/sender_id/open_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("invalid feishu event: missing sender open_id"))?;

    Ok(Some(FeishuTextEvent {
        event_id: event_id.to_string(),
        message_id: field("message_id")?,
        chat_id: field("chat_id")?,
        sender_open_id: sender_open_id.to_string(),
        is_group: message.get("chat_type").and_then(Value::as_str) == Some("group"),
        text,
    }))
}

#[tracing::instrument(level = "debug", skip_all)]
async fn receive_event(
    State(adapter): State<Arc<FeishuAdapter>>,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if payload.get("encrypt").is_some() {
        tracing::warn!("feishu encrypted event received; disable event encryption for this app");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "encrypted events are not supported" })),
        );
    }

    if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
        if !adapter.token_matches(payload.get("token").and_then(Value::as_str)) {
            tracing::warn!("feishu url_verification token mismatch");
            return (StatusCode::FORBIDDEN, Json(json!({ "error": "invalid token" })));
        }
        let challenge = payload.get("challenge").cloned().unwrap_or(Value::Null);
        return (StatusCode::OK, Json(json!({ "challenge": challenge })));
    }

    if !adapter.token_matches(payload.pointer("/header/token").and_then(Value::as_str)) {
        tracing::warn!("feishu event token mismatch");
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "invalid token" })));
    }

    let event = match parse_message_event(&payload) {
        Ok(Some(event)) => event,
        Ok(None) => return (StatusCode::OK, Json(json!({}))),
        Err(e) => {
            tracing::warn!(%e, "feishu event unreadable");
            return (StatusCode::OK, Json(json!({})));
        }
    };
    if !adapter.first_sighting(&event.event_id) {
        tracing::debug!(event_id = %event.event_id, "feishu duplicate event skipped");
        return (StatusCode::OK, Json(json!({})));
    }

    let inbound = InboundMessage {
        message_id: event.message_id.into(),
        channel_id: FEISHU_CHANNEL.into(),
        account_id: adapter.config.account_id.clone(),
        sender_id: event.sender_open_id.into(),
        chat_id: event.chat_id.into(),
        is_group: event.is_group,
        content: event.text,
        metadata: json!({ "event_id": event.event_id }),
        received_at: Utc::now(),
    };
    // Forwarded before the ack so acked events reach the gateway in ack order.
    let tx = adapter.inbound_tx.read().await.clone();
    match tx {
        Some(tx) => {
            if let Err(e) = tx.send(inbound).await {
                tracing::error!(%e, "feishu inbound queue closed");
            }
        }
        None => tracing::error!("feishu adapter started without inbound queue"),
    }
    (StatusCode::OK, Json(json!({})))
}

#[async_trait::async_trait]
impl ChannelAdapter for FeishuAdapter {
    fn channel_id(&self) -> &str {
        FEISHU_CHANNEL
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.inbound_tx.write().await = Some(tx);
        tracing::info!(account_id = %self.config.account_id, "feishu events ready at /feishu/events");
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let content = json!({ "text": message.content }).to_string();
        self.create_message(
            recipient_id,
            "text",
            content,
            message.reply_to_message_id.as_ref(),
        )
        .await
    }

    async fn create_placeholder(&self, recipient_id: &str, text: &str) -> Result<MessageId> {
        self.create_message(recipient_id, "interactive", card_content(text), None)
            .await
    }

    async fn edit_message(
        &self,
        _recipient_id: &str,
        message_id: &MessageId,
        text: &str,
    ) -> Result<()> {
        let token = self.tenant_token().await?;
        let resp = self
            .http
            .patch(self.api_url(&format!("/im/v1/messages/{message_id}")))
            .bearer_auth(token)
            .json(&json!({ "content": card_content(text) }))
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(anyhow!("feishu patch failed: status={status} body={body}"));
        }
        check_code(&body, "feishu patch failed")
    }

    fn supports_message_edits(&self) -> bool {
        true
    }
}
