use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub onebot_api_base_url: String,
    pub onebot_access_token: Option<String>,
    pub onebot_timeout: Duration,

    /// Log messages instead of sending them
    pub dry_run: bool,

    pub subscriptions_path: PathBuf,
    pub nodes_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dry_run = parse_bool_env("DRY_RUN", false);

        let onebot_api_base_url = match env::var("ONEBOT_API_BASE_URL") {
            Ok(url) => url,
            Err(_) if dry_run => "http://127.0.0.1:5700".to_string(),
            Err(_) => {
                return Err(anyhow!(
                    "ONEBOT_API_BASE_URL must be set (e.g. http://127.0.0.1:5700) unless DRY_RUN=true"
                ))
            }
        };
        let onebot_access_token = env::var("ONEBOT_ACCESS_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        let onebot_timeout =
            Duration::from_secs(parse_u64_env("ONEBOT_TIMEOUT_SECS", 10).context("ONEBOT_TIMEOUT_SECS")?);

        let subscriptions_path = env::var("SUBSCRIPTIONS_PATH")
            .unwrap_or_else(|_| "data/subscriptions.json".to_string())
            .into();
        let nodes_path = env::var("NODES_PATH").ok().map(PathBuf::from);

        let config = Self {
            onebot_api_base_url,
            onebot_access_token,
            onebot_timeout,
            dry_run,
            subscriptions_path,
            nodes_path,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.dry_run
            && !(self.onebot_api_base_url.starts_with("http://")
                || self.onebot_api_base_url.starts_with("https://"))
        {
            return Err(anyhow!(
                "Invalid ONEBOT_API_BASE_URL: {} (expected http(s) URL)",
                self.onebot_api_base_url
            ));
        }
        if self.onebot_timeout.is_zero() {
            return Err(anyhow!("ONEBOT_TIMEOUT_SECS must be greater than zero"));
        }
        Ok(())
    }
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "y" | "on"))
        .unwrap_or(default)
}

fn parse_u64_env(key: &str, default: u64) -> Result<u64> {
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse::<u64>()
        .with_context(|| format!("Invalid {key}: {raw} (expected integer)"))
}
