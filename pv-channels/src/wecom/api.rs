use super::WecomConfig;
use anyhow::{Result, anyhow};
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Refresh this long before the server-side expiry.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);
const TOKEN_EXPIRED_CODES: [i64; 2] = [40014, 42001];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WecomTarget {
    User(String),
    Chat(String),
}

impl WecomTarget {
    /// `user:<id>`, `chat:<id>`, or a bare user id.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let target = if let Some(id) = raw.strip_prefix("chat:") {
            Self::Chat(id.trim().to_string())
        } else if let Some(id) = raw.strip_prefix("user:") {
            Self::User(id.trim().to_string())
        } else {
            Self::User(raw.to_string())
        };
        match &target {
            Self::User(id) | Self::Chat(id) if id.is_empty() => {
                Err(anyhow!("wecom recipient is empty: {raw:?}"))
            }
            _ => Ok(target),
        }
    }
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Minimal WeCom server API client: token cache plus text message send.
pub struct WecomApiClient {
    http: reqwest::Client,
    base_url: String,
    corp_id: String,
    corp_secret: String,
    agent_id: i64,
    token: Mutex<Option<CachedToken>>,
}

impl WecomApiClient {
    pub fn new(config: &WecomConfig) -> Result<Self> {
        let agent_id = config
            .agent_id
            .trim()
            .parse::<i64>()
            .map_err(|_| anyhow!("wecom agent_id must be numeric: {:?}", config.agent_id))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            corp_id: config.corp_id.clone(),
            corp_secret: config.corp_secret.clone(),
            agent_id,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!("{}/cgi-bin/gettoken", self.base_url);
        let resp = self
            .http
            .get(url)
            .query(&[
                ("corpid", self.corp_id.as_str()),
                ("corpsecret", self.corp_secret.as_str()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("wecom token failed: status={status} body={body}"));
        }
        let body: Value = resp.json().await?;
        check_errcode(&body, "wecom token failed")?;

        let value = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow!("wecom token response missing access_token"))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(7200);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        tracing::debug!(expires_in, "wecom access token refreshed");
        Ok(value)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    /// Sends a text message. Returns the platform `msgid` when one is reported.
    pub async fn send_text(&self, target: &WecomTarget, content: &str) -> Result<Option<String>> {
        let mut payload = json!({
            "agentid": self.agent_id,
            "msgtype": "text",
            "text": { "content": content },
            "safe": 0,
        });
        match target {
            WecomTarget::User(id) => payload["touser"] = Value::String(id.clone()),
            WecomTarget::Chat(id) => payload["chatid"] = Value::String(id.clone()),
        }

        let mut retried = false;
        loop {
            let token = self.access_token().await?;
            let url = format!("{}/cgi-bin/message/send", self.base_url);
            let resp = self
                .http
                .post(url)
                .query(&[("access_token", token.as_str())])
                .json(&payload)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(anyhow!("wecom send failed: status={status} body={body}"));
            }
            let body: Value = resp.json().await?;
            let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
            if TOKEN_EXPIRED_CODES.contains(&errcode) && !retried {
                tracing::info!(errcode, "wecom access token rejected; refreshing");
                self.invalidate_token().await;
                retried = true;
                continue;
            }
            check_errcode(&body, "wecom send failed")?;
            return Ok(body
                .get("msgid")
                .and_then(Value::as_str)
                .map(str::to_string));
        }
    }
}

fn check_errcode(body: &Value, context: &str) -> Result<()> {
    let errcode = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if errcode == 0 {
        return Ok(());
    }
    let errmsg = body
        .get("errmsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    Err(anyhow!("{context}: {errcode} - {errmsg}"))
}
