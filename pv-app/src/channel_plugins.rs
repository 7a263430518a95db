use crate::config::PalaverConfig;
use anyhow::Result;
use axum::Router;
use pv_channels::{ChannelAdapter, FeishuAdapter, InboundMessage, WebChatAdapter, WecomAdapter};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPluginId {
    WebChat,
    Wecom,
    Feishu,
}

impl ChannelPluginId {
    pub const ALL: [Self; 3] = [Self::WebChat, Self::Wecom, Self::Feishu];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebChat => pv_channels::WEBCHAT_CHANNEL,
            Self::Wecom => pv_channels::WECOM_CHANNEL,
            Self::Feishu => pv_channels::FEISHU_CHANNEL,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelCapabilitySchema {
    /// Replies stream into a placeholder that is edited in place.
    pub supports_message_edits: bool,
}

pub struct LoadedChannel {
    pub plugin_id: ChannelPluginId,
    pub adapter: Arc<dyn ChannelAdapter>,
    pub router: Option<Router>,
}

pub struct ChannelLoadResult {
    pub channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    pub routers: Vec<Router>,
    pub capability_matrix: HashMap<String, ChannelCapabilitySchema>,
}

pub fn plugin_enabled(cfg: &PalaverConfig, plugin_id: ChannelPluginId) -> bool {
    match plugin_id {
        ChannelPluginId::WebChat => cfg.channels.webchat.enabled,
        ChannelPluginId::Wecom => cfg.channels.wecom.enabled,
        ChannelPluginId::Feishu => cfg.channels.feishu.enabled,
    }
}

pub async fn load_enabled_channels(
    cfg: &PalaverConfig,
    inbound_tx: mpsc::Sender<InboundMessage>,
) -> Result<ChannelLoadResult> {
    let mut channels = HashMap::new();
    let mut routers = Vec::new();
    let mut capability_matrix = HashMap::new();

    for plugin_id in ChannelPluginId::ALL {
        if !plugin_enabled(cfg, plugin_id) {
            continue;
        }
        let loaded = build_plugin(plugin_id, cfg)?;
        loaded.adapter.start(inbound_tx.clone()).await?;
        let channel_id = loaded.plugin_id.as_str().to_string();
        capability_matrix.insert(
            channel_id.clone(),
            ChannelCapabilitySchema {
                supports_message_edits: loaded.adapter.supports_message_edits(),
            },
        );
        channels.insert(channel_id, loaded.adapter);
        if let Some(router) = loaded.router {
            routers.push(router);
        }
    }

    Ok(ChannelLoadResult {
        channels,
        routers,
        capability_matrix,
    })
}

/// Builds an adapter without starting it.
pub fn build_plugin(plugin_id: ChannelPluginId, cfg: &PalaverConfig) -> Result<LoadedChannel> {
    match plugin_id {
        ChannelPluginId::WebChat => {
            let webchat = Arc::new(WebChatAdapter::new());
            let router = Some(webchat.clone().router());
            Ok(LoadedChannel {
                plugin_id,
                adapter: webchat,
                router,
            })
        }
        ChannelPluginId::Wecom => {
            let wecom = Arc::new(WecomAdapter::new(cfg.wecom_config())?);
            tracing::info!(mode = wecom.mode(), "wecom adapter built");
            let router = Some(wecom.router());
            Ok(LoadedChannel {
                plugin_id,
                adapter: wecom,
                router,
            })
        }
        ChannelPluginId::Feishu => {
            let feishu = Arc::new(FeishuAdapter::new(cfg.feishu_config())?);
            let router = Some(feishu.clone().router());
            Ok(LoadedChannel {
                plugin_id,
                adapter: feishu,
                router,
            })
        }
    }
}

pub fn find_plugin(channel: &str) -> Option<ChannelPluginId> {
    ChannelPluginId::ALL
        .into_iter()
        .find(|plugin_id| plugin_id.as_str().eq_ignore_ascii_case(channel.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_only_enabled_channels() {
        let cfg = PalaverConfig::parse(
            r#"
            [general]
            model = "m"
            [keys]
            openai_api_key = "k"
            [channels.feishu]
            enabled = true
            app_id = "cli_1"
            app_secret = "s"
        "#,
        )
        .expect("parse");
        let (tx, _rx) = mpsc::channel(4);
        let loaded = load_enabled_channels(&cfg, tx).await.expect("load");

        let mut ids: Vec<&String> = loaded.channels.keys().collect();
        ids.sort();
        assert_eq!(ids, vec!["feishu", "webchat"]);
        assert_eq!(loaded.routers.len(), 2);
        assert!(loaded.capability_matrix["feishu"].supports_message_edits);
    }

    #[test]
    fn finds_plugins_by_name() {
        assert_eq!(find_plugin("WeCom"), Some(ChannelPluginId::Wecom));
        assert_eq!(find_plugin("telegram"), None);
    }
}
