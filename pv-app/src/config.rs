//! Palaver configuration loader.
//!
//! TOML file, then environment overrides, then validation.

use pv_channels::{
    DEFAULT_FEISHU_API_BASE_URL, DEFAULT_WECOM_API_BASE_URL, FEISHU_CHANNEL, FeishuConfig,
    WECOM_CHANNEL, WEBCHAT_CHANNEL, WecomConfig, WecomCrypto,
};
use pv_sched::{PerChannel, SchedulerConfig};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct PalaverConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Messages (user and assistant) kept per conversation.
    #[serde(default = "default_history_max_messages")]
    pub history_max_messages: usize,
}

fn default_system_prompt() -> String {
    "You are a helpful assistant. Keep replies concise.".to_string()
}

fn default_api_base_url() -> String {
    pv_llm::DEFAULT_API_BASE_URL.to_string()
}

fn default_history_max_messages() -> usize {
    20
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_text_chunk_limit")]
    pub text_chunk_limit: usize,
    #[serde(default = "default_queued_notice")]
    pub queued_notice: String,
    #[serde(default = "default_failure_notice")]
    pub failure_notice: String,
}

fn default_debounce_ms() -> u64 {
    pv_sched::DEFAULT_DEBOUNCE.as_millis() as u64
}

fn default_max_concurrent() -> usize {
    pv_sched::DEFAULT_MAX_CONCURRENT
}

fn default_update_interval_ms() -> u64 {
    pv_sched::DEFAULT_UPDATE_INTERVAL.as_millis() as u64
}

fn default_text_chunk_limit() -> usize {
    pv_sched::DEFAULT_TEXT_CHUNK_LIMIT
}

fn default_queued_notice() -> String {
    pv_sched::DEFAULT_QUEUED_NOTICE.to_string()
}

fn default_failure_notice() -> String {
    pv_sched::DEFAULT_FAILURE_NOTICE.to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_concurrent: default_max_concurrent(),
            update_interval_ms: default_update_interval_ms(),
            text_chunk_limit: default_text_chunk_limit(),
            queued_notice: default_queued_notice(),
            failure_notice: default_failure_notice(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub webchat: WebChatSection,
    #[serde(default)]
    pub wecom: WecomSection,
    #[serde(default)]
    pub feishu: FeishuSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebChatSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for WebChatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: None,
            text_chunk_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WecomSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default)]
    pub corp_id: String,
    #[serde(default)]
    pub corp_secret: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding_aes_key: String,
    /// Relay socket URL. When set, the local callback route is not served.
    #[serde(default)]
    pub relay_url: Option<String>,
    #[serde(default = "default_wecom_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
}

fn default_account_id() -> String {
    pv_channels::DEFAULT_ACCOUNT_ID.to_string()
}

fn default_wecom_api_base_url() -> String {
    DEFAULT_WECOM_API_BASE_URL.to_string()
}

impl Default for WecomSection {
    fn default() -> Self {
        Self {
            enabled: false,
            account_id: default_account_id(),
            corp_id: String::new(),
            corp_secret: String::new(),
            agent_id: String::new(),
            token: String::new(),
            encoding_aes_key: String::new(),
            relay_url: None,
            api_base_url: default_wecom_api_base_url(),
            debounce_ms: None,
            text_chunk_limit: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeishuSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_account_id")]
    pub account_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub verification_token: String,
    #[serde(default = "default_feishu_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub debounce_ms: Option<u64>,
    #[serde(default)]
    pub text_chunk_limit: Option<usize>,
}

fn default_feishu_api_base_url() -> String {
    DEFAULT_FEISHU_API_BASE_URL.to_string()
}

impl Default for FeishuSection {
    fn default() -> Self {
        Self {
            enabled: false,
            account_id: default_account_id(),
            app_id: String::new(),
            app_secret: String::new(),
            verification_token: String::new(),
            api_base_url: default_feishu_api_base_url(),
            debounce_ms: None,
            text_chunk_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Open,
    #[default]
    Allowlist,
    Disabled,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub dm_policy: DmPolicy,
    /// `channel:sender` pins a sender to one channel; a bare sender id matches on any
    /// channel; `*` admits everyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    30
}

fn default_http_max_in_flight() -> usize {
    256
}

fn default_shutdown_grace_seconds() -> u64 {
    15
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
        }
    }
}

impl PalaverConfig {
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, PathBuf)> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::parse(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;
        cfg.apply_env_overrides(|name| std::env::var(name).ok());
        cfg.validate()?;
        Ok((cfg, path))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = var("PALAVER_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = var("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = var("OPENAI_BASE_URL") {
            self.general.api_base_url = v;
        }
        if let Some(v) = var("WECOM_CORP_SECRET") {
            self.channels.wecom.corp_secret = v;
        }
        if let Some(v) = var("FEISHU_APP_SECRET") {
            self.channels.feishu.app_secret = v;
        }
        if let Some(v) = var("PALAVER_MAX_CONCURRENT") {
            match v.trim().parse() {
                Ok(n) => self.scheduler.max_concurrent = n,
                Err(e) => tracing::warn!(%e, value = %v, "ignoring invalid PALAVER_MAX_CONCURRENT"),
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if self.api_key().is_none() {
            return Err(anyhow::anyhow!(
                "keys.openai_api_key is required (or set OPENAI_API_KEY)"
            ));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(anyhow::anyhow!("scheduler.max_concurrent must be >= 1"));
        }
        if self.scheduler.text_chunk_limit == 0 {
            return Err(anyhow::anyhow!("scheduler.text_chunk_limit must be > 0"));
        }
        for (channel, limit) in [
            (WEBCHAT_CHANNEL, self.channels.webchat.text_chunk_limit),
            (WECOM_CHANNEL, self.channels.wecom.text_chunk_limit),
            (FEISHU_CHANNEL, self.channels.feishu.text_chunk_limit),
        ] {
            if limit == Some(0) {
                return Err(anyhow::anyhow!(
                    "channels.{channel}.text_chunk_limit must be > 0"
                ));
            }
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        self.bind_addr()?;

        let wecom = &self.channels.wecom;
        if wecom.enabled {
            if wecom.relay_url.as_deref().is_some_and(|url| url.trim().is_empty()) {
                return Err(anyhow::anyhow!("channels.wecom.relay_url must not be empty"));
            }
            if wecom.relay_url.is_none() {
                for (field, value) in [
                    ("corp_id", &wecom.corp_id),
                    ("corp_secret", &wecom.corp_secret),
                    ("agent_id", &wecom.agent_id),
                    ("token", &wecom.token),
                    ("encoding_aes_key", &wecom.encoding_aes_key),
                ] {
                    if value.trim().is_empty() {
                        return Err(anyhow::anyhow!("channels.wecom.{field} is required"));
                    }
                }
                WecomCrypto::new(&wecom.token, &wecom.encoding_aes_key, &wecom.corp_id)
                    .map_err(|e| anyhow::anyhow!("channels.wecom.encoding_aes_key: {e}"))?;
            }
        }

        let feishu = &self.channels.feishu;
        if feishu.enabled {
            for (field, value) in [("app_id", &feishu.app_id), ("app_secret", &feishu.app_secret)] {
                if value.trim().is_empty() {
                    return Err(anyhow::anyhow!("channels.feishu.{field} is required"));
                }
            }
        }
        Ok(())
    }

    pub fn api_key(&self) -> Option<String> {
        self.keys
            .openai_api_key
            .clone()
            .filter(|s| !s.trim().is_empty())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.runtime
            .bind_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("runtime.bind_addr {:?}: {e}", self.runtime.bind_addr))
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let section = &self.scheduler;
        let mut debounce = PerChannel::new(Duration::from_millis(section.debounce_ms));
        let mut text_chunk_limit = PerChannel::new(section.text_chunk_limit);
        for (channel, debounce_ms, chunk_limit) in [
            (
                WEBCHAT_CHANNEL,
                self.channels.webchat.debounce_ms,
                self.channels.webchat.text_chunk_limit,
            ),
            (
                WECOM_CHANNEL,
                self.channels.wecom.debounce_ms,
                self.channels.wecom.text_chunk_limit,
            ),
            (
                FEISHU_CHANNEL,
                self.channels.feishu.debounce_ms,
                self.channels.feishu.text_chunk_limit,
            ),
        ] {
            if let Some(ms) = debounce_ms {
                debounce = debounce.with_override(channel, Duration::from_millis(ms));
            }
            if let Some(limit) = chunk_limit {
                text_chunk_limit = text_chunk_limit.with_override(channel, limit);
            }
        }
        SchedulerConfig {
            debounce,
            max_concurrent: section.max_concurrent,
            update_interval: Duration::from_millis(section.update_interval_ms),
            text_chunk_limit,
            queued_notice: section.queued_notice.clone(),
            failure_notice: section.failure_notice.clone(),
        }
    }

    pub fn wecom_config(&self) -> WecomConfig {
        let section = &self.channels.wecom;
        WecomConfig {
            account_id: section.account_id.clone(),
            corp_id: section.corp_id.clone(),
            corp_secret: section.corp_secret.clone(),
            agent_id: section.agent_id.clone(),
            token: section.token.clone(),
            encoding_aes_key: section.encoding_aes_key.clone(),
            relay_url: section.relay_url.clone(),
            api_base_url: section.api_base_url.clone(),
        }
    }

    pub fn feishu_config(&self) -> FeishuConfig {
        let section = &self.channels.feishu;
        FeishuConfig {
            account_id: section.account_id.clone(),
            app_id: section.app_id.clone(),
            app_secret: section.app_secret.clone(),
            verification_token: section.verification_token.clone(),
            api_base_url: section.api_base_url.clone(),
        }
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".palaver").join("config.toml")
}
