//! Direct-message access policy.

use crate::config::{DmPolicy, SecurityConfig};
use pv_channels::WEBCHAT_CHANNEL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Disabled,
    NotAllowlisted,
}

impl AccessDecision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Decides whether a sender may talk to the bot. WebChat is local and always open.
pub fn evaluate_sender(cfg: &SecurityConfig, channel_id: &str, sender_id: &str) -> AccessDecision {
    if channel_id == WEBCHAT_CHANNEL {
        return AccessDecision::Allowed;
    }
    match cfg.dm_policy {
        DmPolicy::Open => AccessDecision::Allowed,
        DmPolicy::Disabled => AccessDecision::Disabled,
        DmPolicy::Allowlist if is_allowlisted(cfg, channel_id, sender_id) => {
            AccessDecision::Allowed
        }
        DmPolicy::Allowlist => AccessDecision::NotAllowlisted,
    }
}

fn is_allowlisted(cfg: &SecurityConfig, channel_id: &str, sender_id: &str) -> bool {
    let sender_id = sender_id.trim();
    cfg.allowed_users.iter().map(|entry| entry.trim()).any(|entry| {
        if entry == "*" {
            return true;
        }
        match entry.split_once(':') {
            Some((channel, sender)) => {
                channel.eq_ignore_ascii_case(channel_id) && (sender == "*" || sender == sender_id)
            }
            None => entry == sender_id,
        }
    })
}
