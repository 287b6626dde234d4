//! reqwest-backed upstream fetcher.
//!
//! Maps a platform key to an endpoint URL. The official world-state endpoint
//! serves JSON as `text/html`, so bodies are always parsed from text.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use super::UpstreamFetcher;

#[derive(Debug, Clone)]
pub struct HttpWorldStateFetcher {
    client: Client,
    endpoints: HashMap<String, String>,
}

impl HttpWorldStateFetcher {
    pub fn new(endpoints: HashMap<String, String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Worldstate-Monitor/1.0")
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client, endpoints })
    }

    /// Register or replace the endpoint for a platform key.
    pub fn with_endpoint(mut self, platform: &str, url: &str) -> Self {
        self.endpoints.insert(platform.to_string(), url.to_string());
        self
    }

    fn url_for(&self, platform: &str) -> Result<&str> {
        self.endpoints
            .get(platform)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("No endpoint configured for platform {}", platform))
    }
}

#[async_trait]
impl UpstreamFetcher for HttpWorldStateFetcher {
    async fn fetch(&self, platform: &str) -> Result<Value> {
        let url = self.url_for(platform)?;
        debug!(platform, url, "GET world state");

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read body from {}", url))?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {} from {}", status, url));
        }

        parse_payload(&body).with_context(|| format!("Malformed payload from {}", url))
    }
}

fn parse_payload(body: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(body.trim_start_matches('\u{feff}'))?;
    if !value.is_object() {
        return Err(anyhow!("expected a JSON object at the top level"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_accepts_object() {
        let value = parse_payload(r#"{"ActiveMissions": []}"#).unwrap();
        assert!(value["ActiveMissions"].is_array());
    }

    #[test]
    fn test_parse_payload_strips_bom() {
        assert!(parse_payload("\u{feff}{\"Time\": 1}").is_ok());
    }

    #[test]
    fn test_parse_payload_rejects_non_object() {
        assert!(parse_payload("[1, 2]").is_err());
        assert!(parse_payload("<html>").is_err());
    }

    #[tokio::test]
    async fn test_unknown_platform_is_error() {
        let fetcher = HttpWorldStateFetcher::new(HashMap::new(), Duration::from_secs(1))
            .unwrap()
            .with_endpoint("pc", "http://127.0.0.1:9/worldState.php");
        let err = fetcher.fetch("switch").await.unwrap_err();
        assert!(err.to_string().contains("switch"));
    }
}
