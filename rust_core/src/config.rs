//! Runtime configuration for the world-state client and monitors.
//!
//! Every value comes from the environment with a documented fallback.
//! `validate()` must pass before any monitor loop starts.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_WORLD_STATE_URL: &str = "https://api.warframe.com/cdn/worldState.php";
pub const DEFAULT_BOUNTY_CYCLE_URL: &str = "https://oracle.browse.wf/bounty-cycle";

/// Platform key the bounty rotation feed is registered under.
pub const BOUNTY_CYCLE_PLATFORM: &str = "bounty-cycle";

/// Zariman bounty challenges worth announcing.
pub const DEFAULT_ZARIMAN_CHALLENGES: &[&str] = &[
    "/Lotus/Types/Challenges/Zariman/ZarimanExterminateFastCompleteChallenge",
    "/Lotus/Types/Challenges/Zariman/ZarimanUseVoidRiftsChallenge",
    "/Lotus/Types/Challenges/Zariman/ZarimanDefeatVoidAngelChallenge",
];

/// Upper bound for every duration setting.
pub const MAX_DURATION_SETTING: Duration = Duration::from_secs(7 * 86_400);

/// World-state client settings
#[derive(Debug, Clone)]
pub struct WorldStateConfig {
    pub world_state_url: String,
    pub bounty_cycle_url: String,
    /// Platform polled by the fissure and void trader monitors
    pub platform: String,
    /// How long a fetched snapshot is served without a network call
    pub cache_ttl: Duration,
    pub request_timeout: Duration,
    /// Upper bound on a single listener callback
    pub listener_timeout: Duration,
}

/// Per-monitor loop settings
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub base_interval: Duration,
    pub backoff_cap: Duration,
    /// Groups that receive display notifications for every new entry
    pub display_targets: Vec<String>,
}

impl MonitorConfig {
    pub fn new(base_interval: Duration, backoff_cap: Duration) -> Self {
        Self {
            base_interval,
            backoff_cap,
            display_targets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub world_state: WorldStateConfig,
    pub fissure: MonitorConfig,
    pub void_trader: MonitorConfig,
    pub zariman: MonitorConfig,
    pub max_subscriptions_per_owner: usize,
    pub zariman_target_node: String,
    pub zariman_target_challenges: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let cap = Duration::from_secs(30 * 60);
        Self {
            world_state: WorldStateConfig {
                world_state_url: DEFAULT_WORLD_STATE_URL.to_string(),
                bounty_cycle_url: DEFAULT_BOUNTY_CYCLE_URL.to_string(),
                platform: "pc".to_string(),
                cache_ttl: Duration::from_secs(300),
                request_timeout: Duration::from_secs(10),
                listener_timeout: Duration::from_secs(5),
            },
            fissure: MonitorConfig::new(Duration::from_secs(60), cap),
            void_trader: MonitorConfig::new(Duration::from_secs(300), cap),
            zariman: MonitorConfig::new(Duration::from_secs(300), cap),
            max_subscriptions_per_owner: 5,
            zariman_target_node: "SolNode231".to_string(),
            zariman_target_challenges: DEFAULT_ZARIMAN_CHALLENGES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl CoreConfig {
    /// Create config from environment variables with fallback to defaults
    pub fn from_env() -> CoreResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys fall back to defaults,
    /// set-but-unparseable keys are a `Configuration` error.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let cap = parse_secs(&lookup, "MONITOR_BACKOFF_CAP_SECS", defaults.fissure.backoff_cap)?;
        let shared_targets = parse_csv(&lookup, "MONITOR_TARGET_GROUPS");

        let monitor = |prefix: &str, fallback: &MonitorConfig| -> CoreResult<MonitorConfig> {
            let targets = parse_csv(&lookup, &format!("{prefix}_TARGET_GROUPS"));
            Ok(MonitorConfig {
                base_interval: parse_secs(
                    &lookup,
                    &format!("{prefix}_POLL_INTERVAL_SECS"),
                    fallback.base_interval,
                )?,
                backoff_cap: cap,
                display_targets: if targets.is_empty() {
                    shared_targets.clone()
                } else {
                    targets
                },
            })
        };

        let challenges = parse_csv(&lookup, "ZARIMAN_TARGET_CHALLENGES");

        let config = Self {
            world_state: WorldStateConfig {
                world_state_url: lookup("WORLD_STATE_URL")
                    .unwrap_or(defaults.world_state.world_state_url),
                bounty_cycle_url: lookup("BOUNTY_CYCLE_URL")
                    .unwrap_or(defaults.world_state.bounty_cycle_url),
                platform: lookup("WORLD_STATE_PLATFORM").unwrap_or(defaults.world_state.platform),
                cache_ttl: parse_secs(
                    &lookup,
                    "WORLD_STATE_CACHE_TTL_SECS",
                    defaults.world_state.cache_ttl,
                )?,
                request_timeout: parse_secs(
                    &lookup,
                    "WORLD_STATE_REQUEST_TIMEOUT_SECS",
                    defaults.world_state.request_timeout,
                )?,
                listener_timeout: parse_secs(
                    &lookup,
                    "WORLD_STATE_LISTENER_TIMEOUT_SECS",
                    defaults.world_state.listener_timeout,
                )?,
            },
            fissure: monitor("FISSURE", &defaults.fissure)?,
            void_trader: monitor("VOID_TRADER", &defaults.void_trader)?,
            zariman: monitor("ZARIMAN", &defaults.zariman)?,
            max_subscriptions_per_owner: parse_usize(
                &lookup,
                "MAX_SUBSCRIPTIONS_PER_OWNER",
                defaults.max_subscriptions_per_owner,
            )?,
            zariman_target_node: lookup("ZARIMAN_TARGET_NODE")
                .unwrap_or(defaults.zariman_target_node),
            zariman_target_challenges: if challenges.is_empty() {
                defaults.zariman_target_challenges
            } else {
                challenges
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        let ws = &self.world_state;
        check_upper_bound("cache TTL", ws.cache_ttl)?;
        check_upper_bound("request timeout", ws.request_timeout)?;
        check_upper_bound("listener timeout", ws.listener_timeout)?;
        if ws.cache_ttl.is_zero() {
            return Err(CoreError::config("cache TTL must be greater than zero"));
        }
        if ws.request_timeout.is_zero() {
            return Err(CoreError::config("request timeout must be greater than zero"));
        }
        if ws.listener_timeout.is_zero() {
            return Err(CoreError::config("listener timeout must be greater than zero"));
        }
        if ws.platform.trim().is_empty() {
            return Err(CoreError::config("platform must not be empty"));
        }
        for (name, monitor) in [
            ("fissure", &self.fissure),
            ("void_trader", &self.void_trader),
            ("zariman", &self.zariman),
        ] {
            if monitor.base_interval.is_zero() {
                return Err(CoreError::config(format!(
                    "{name} poll interval must be greater than zero"
                )));
            }
            check_upper_bound(&format!("{name} poll interval"), monitor.base_interval)?;
            check_upper_bound(&format!("{name} backoff cap"), monitor.backoff_cap)?;
            if monitor.backoff_cap < monitor.base_interval {
                return Err(CoreError::config(format!(
                    "{name} backoff cap ({:?}) is below its base interval ({:?})",
                    monitor.backoff_cap, monitor.base_interval
                )));
            }
        }
        if self.max_subscriptions_per_owner == 0 {
            return Err(CoreError::config(
                "max subscriptions per owner must be at least 1",
            ));
        }
        Ok(())
    }

    /// Platform key -> upstream URL table for the HTTP fetcher.
    pub fn endpoints(&self) -> HashMap<String, String> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            self.world_state.platform.clone(),
            self.world_state.world_state_url.clone(),
        );
        endpoints.insert(
            BOUNTY_CYCLE_PLATFORM.to_string(),
            self.world_state.bounty_cycle_url.clone(),
        );
        endpoints
    }
}

fn check_upper_bound(name: &str, value: Duration) -> CoreResult<()> {
    if value > MAX_DURATION_SETTING {
        return Err(CoreError::config(format!(
            "{name} ({}s) exceeds the maximum of {}s",
            value.as_secs(),
            MAX_DURATION_SETTING.as_secs()
        )));
    }
    Ok(())
}

fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> CoreResult<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| CoreError::config(format!("Invalid {key}: {raw} (expected seconds)"))),
    }
}

fn parse_usize<F>(lookup: &F, key: &str, default: usize) -> CoreResult<usize>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|_| CoreError::config(format!("Invalid {key}: {raw} (expected integer)"))),
    }
}

fn parse_csv<F>(lookup: &F, key: &str) -> Vec<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
