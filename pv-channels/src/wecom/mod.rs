//! WeCom (企业微信) adapter.
//!
//! Two inbound modes: an HTTP callback that this process serves itself, or a relay
//! socket to a cloud server that owns the callback URL. Outbound goes through the
//! WeCom API in callback mode and through the relay in relay mode.

mod api;
mod callback;
mod crypto;
mod relay;
mod xml;

pub use crypto::WecomCrypto;

use crate::traits::ChannelAdapter;
use crate::types::{DEFAULT_ACCOUNT_ID, InboundMessage, MessageId, OutboundMessage};
use anyhow::{Result, anyhow};
use api::{WecomApiClient, WecomTarget};
use axum::Router;
use callback::CallbackState;
use chrono::Utc;
use relay::RelayClient;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WECOM_CHANNEL: &str = "wecom";
pub const DEFAULT_WECOM_API_BASE_URL: &str = "https://qyapi.weixin.qq.com";

#[derive(Debug, Clone)]
pub struct WecomConfig {
    pub account_id: String,
    pub corp_id: String,
    pub corp_secret: String,
    pub agent_id: String,
    pub token: String,
    pub encoding_aes_key: String,
    /// When set, messages flow through the relay socket instead of the local callback.
    pub relay_url: Option<String>,
    pub api_base_url: String,
}

impl Default for WecomConfig {
    fn default() -> Self {
        Self {
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            corp_id: String::new(),
            corp_secret: String::new(),
            agent_id: String::new(),
            token: String::new(),
            encoding_aes_key: String::new(),
            relay_url: None,
            api_base_url: DEFAULT_WECOM_API_BASE_URL.to_string(),
        }
    }
}

/// A decrypted text message, from either the callback or the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WecomTextMessage {
    pub from_user: String,
    pub to_user: String,
    pub content: String,
    pub msg_id: Option<String>,
    pub agent_id: Option<String>,
    pub create_time: Option<i64>,
}

impl WecomTextMessage {
    /// WeCom app messages are direct chats: the sender is also the reply recipient.
    pub fn into_inbound(self, account_id: &str) -> InboundMessage {
        let metadata = serde_json::json!({
            "to_user": self.to_user,
            "agent_id": self.agent_id,
            "create_time": self.create_time,
        });
        InboundMessage {
            message_id: self
                .msg_id
                .unwrap_or_else(|| Uuid::new_v4().to_string())
                .into(),
            channel_id: WECOM_CHANNEL.into(),
            account_id: account_id.to_string(),
            sender_id: self.from_user.clone().into(),
            chat_id: self.from_user.into(),
            is_group: false,
            content: self.content,
            metadata,
            received_at: Utc::now(),
        }
    }
}

enum Transport {
    Callback {
        state: Arc<CallbackState>,
        api: WecomApiClient,
    },
    Relay(Arc<RelayClient>),
}

pub struct WecomAdapter {
    account_id: String,
    transport: Transport,
}

impl WecomAdapter {
    pub fn new(config: WecomConfig) -> Result<Self> {
        let transport = match config
            .relay_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
        {
            Some(url) => Transport::Relay(Arc::new(RelayClient::new(url))),
            None => {
                let crypto =
                    WecomCrypto::new(&config.token, &config.encoding_aes_key, &config.corp_id)?;
                if config.corp_secret.trim().is_empty() {
                    return Err(anyhow!("wecom corp_secret missing"));
                }
                Transport::Callback {
                    state: Arc::new(CallbackState::new(crypto, config.account_id.clone())),
                    api: WecomApiClient::new(&config)?,
                }
            }
        };
        Ok(Self {
            account_id: config.account_id,
            transport,
        })
    }

    pub fn mode(&self) -> &'static str {
        match self.transport {
            Transport::Callback { .. } => "callback",
            Transport::Relay(_) => "relay",
        }
    }

    /// Routes served by this process: `/wecom/callback` in callback mode, nothing in relay mode.
    pub fn router(&self) -> Router {
        match &self.transport {
            Transport::Callback { state, .. } => callback::router(state.clone()),
            Transport::Relay(_) => Router::new(),
        }
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for WecomAdapter {
    fn channel_id(&self) -> &str {
        WECOM_CHANNEL
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        match &self.transport {
            Transport::Callback { state, .. } => {
                state.attach(tx).await;
                tracing::info!(account_id = %self.account_id, "wecom callback ready at /wecom/callback");
            }
            Transport::Relay(relay) => {
                let relay = relay.clone();
                let account_id = self.account_id.clone();
                tokio::spawn(async move { relay.run(account_id, tx).await });
            }
        }
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<MessageId> {
        let target = WecomTarget::parse(recipient_id)?;
        let msgid = match &self.transport {
            Transport::Callback { api, .. } => api.send_text(&target, &message.content).await?,
            Transport::Relay(relay) => relay.send(&target, &message.content).await?,
        };
        Ok(msgid
            .unwrap_or_else(|| Uuid::new_v4().to_string())
            .into())
    }
}
