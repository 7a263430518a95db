use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ChannelId);
id_newtype!(SenderId);
id_newtype!(ChatId);

pub const DEFAULT_ACCOUNT_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationKeyError {
    EmptyChannel,
    EmptyChat,
    EmptySender,
}

impl fmt::Display for ConversationKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyChannel => write!(f, "conversation key requires a channel id"),
            Self::EmptyChat => write!(f, "conversation key requires a chat id"),
            Self::EmptySender => write!(f, "conversation key requires a sender id"),
        }
    }
}

impl std::error::Error for ConversationKeyError {}

/// Identity of one logical conversation: who is talking, where, through which account.
///
/// `chat` doubles as the reply recipient. In a direct chat it usually equals the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    channel: ChannelId,
    account: String,
    chat: ChatId,
    sender: SenderId,
}

impl ConversationKey {
    pub fn new(
        channel: impl Into<ChannelId>,
        account: impl Into<String>,
        chat: impl Into<ChatId>,
        sender: impl Into<SenderId>,
    ) -> Result<Self, ConversationKeyError> {
        let channel = channel.into();
        let chat = chat.into();
        let sender = sender.into();
        if channel.trim().is_empty() {
            return Err(ConversationKeyError::EmptyChannel);
        }
        if chat.trim().is_empty() {
            return Err(ConversationKeyError::EmptyChat);
        }
        if sender.trim().is_empty() {
            return Err(ConversationKeyError::EmptySender);
        }
        let account = account.into();
        let account = if account.trim().is_empty() {
            DEFAULT_ACCOUNT_ID.to_string()
        } else {
            account
        };
        Ok(Self {
            channel,
            account,
            chat,
            sender,
        })
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn chat(&self) -> &ChatId {
        &self.chat
    }

    pub fn sender(&self) -> &SenderId {
        &self.sender
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.channel, self.account, self.chat, self.sender
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    pub sender_id: SenderId,
    pub chat_id: ChatId,
    pub is_group: bool,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn conversation_key(&self) -> Result<ConversationKey, ConversationKeyError> {
        ConversationKey::new(
            self.channel_id.clone(),
            self.account_id.clone(),
            self.chat_id.clone(),
            self.sender_id.clone(),
        )
    }
}

fn default_account_id() -> String {
    DEFAULT_ACCOUNT_ID.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub content: String,
    #[serde(default)]
    pub reply_to_message_id: Option<MessageId>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            reply_to_message_id: None,
        }
    }
}
