//! Channel adapters for Palaver.
//!
//! Adapters are pure I/O: they convert platform messages to/from
//! `InboundMessage` / `OutboundMessage` and never make scheduling decisions.

mod feishu;
mod traits;
mod types;
mod webchat;
mod wecom;

pub use feishu::{DEFAULT_FEISHU_API_BASE_URL, FEISHU_CHANNEL, FeishuAdapter, FeishuConfig};
pub use traits::ChannelAdapter;
pub use types::{
    ChannelId, ChatId, ConversationKey, ConversationKeyError, DEFAULT_ACCOUNT_ID, InboundMessage,
    MessageId, OutboundMessage, SenderId,
};
pub use webchat::{WEBCHAT_CHANNEL, WebChatAdapter};
pub use wecom::{
    DEFAULT_WECOM_API_BASE_URL, WECOM_CHANNEL, WecomAdapter, WecomConfig, WecomCrypto,
};
