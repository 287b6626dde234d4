use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use worldstate_core::{DeliveryTarget, NotificationSink};

/// OneBot v11 HTTP API client used as the notification sink.
#[derive(Debug, Clone)]
pub struct OneBotClient {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

#[derive(Debug, Serialize)]
struct GroupMessage<'a> {
    group_id: i64,
    message: &'a str,
}

#[derive(Debug, Serialize)]
struct PrivateMessage<'a> {
    user_id: i64,
    message: &'a str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    retcode: i64,
    #[serde(default)]
    wording: Option<String>,
}

impl OneBotClient {
    pub fn new(base_url: String, access_token: Option<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base_url,
            access_token,
        })
    }

    pub async fn send_group_msg(&self, group_id: &str, message: &str) -> Result<()> {
        let body = GroupMessage {
            group_id: parse_id("group_id", group_id)?,
            message,
        };
        self.call("send_group_msg", &body).await
    }

    pub async fn send_private_msg(&self, user_id: &str, message: &str) -> Result<()> {
        let body = PrivateMessage {
            user_id: parse_id("user_id", user_id)?,
            message,
        };
        self.call("send_private_msg", &body).await
    }

    async fn call<T: Serialize>(&self, action: &str, body: &T) -> Result<()> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), action);
        let mut req = self.http.post(&url).json(body);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .with_context(|| format!("OneBot API request failed: {url}"))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("OneBot API non-2xx: {status} body={text}");
        }

        let parsed: ApiResponse = serde_json::from_str(&text)
            .with_context(|| format!("Unexpected OneBot response: {text}"))?;
        if parsed.status == "failed" || parsed.retcode != 0 {
            anyhow::bail!(
                "OneBot {action} failed: retcode={} {}",
                parsed.retcode,
                parsed.wording.unwrap_or_default()
            );
        }
        debug!(action, "OneBot call ok");
        Ok(())
    }
}

/// `[CQ:at,qq=<user>]` mention prefix followed by the message.
pub fn mention(user_id: &str, message: &str) -> String {
    format!("[CQ:at,qq={}]\n{}", user_id, message)
}

fn parse_id(field: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| anyhow!("Invalid {field}: {raw} (expected numeric id)"))
}

#[async_trait]
impl NotificationSink for OneBotClient {
    async fn deliver(&self, target: &DeliveryTarget, message: &str) -> Result<()> {
        match target {
            DeliveryTarget::Group { group_id } => self.send_group_msg(group_id, message).await,
            DeliveryTarget::User {
                user_id,
                group_id: Some(group_id),
            } => {
                self.send_group_msg(group_id, &mention(user_id, message))
                    .await
            }
            DeliveryTarget::User {
                user_id,
                group_id: None,
            } => self.send_private_msg(user_id, message).await,
        }
    }
}
