//! Zariman bounty monitor.
//!
//! Watches the bounty rotation feed for bounties on one node whose challenge
//! is on a short list. Keys include the rotation's expiry, so a new rotation
//! announces the same challenge again.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::nodes::NodeDirectory;
use super::payload::{format_remaining, parse_mongo_date, str_field};
use super::{FetchedEntries, Monitor};
use crate::config::BOUNTY_CYCLE_PLATFORM;
use crate::error::{CoreError, CoreResult};
use crate::models::{Attributes, DomainEntry, Notification};
use crate::subscriptions::MatchedOwner;
use crate::world_state::WorldStateClient;

pub const ZARIMAN_TOPIC: &str = "zariman_bounty";

const SYNDICATE: &str = "ZarimanSyndicate";
const DIFFICULTY_SUFFIXES: &[&str] = &["VeryHard", "Easy", "Medium", "Hard", "Normal", "Tier1", "Tier2", "Tier3"];

#[derive(Debug, Clone, PartialEq)]
pub struct ZarimanBounty {
    /// 1-based position in the rotation
    pub number: usize,
    pub node_id: String,
    pub node: String,
    pub challenge: String,
    pub rotation_expiry: Option<DateTime<Utc>>,
}

impl ZarimanBounty {
    pub fn challenge_name(&self) -> String {
        readable_challenge(&self.challenge)
    }
}

impl DomainEntry for ZarimanBounty {
    fn key(&self) -> String {
        let expiry = self
            .rotation_expiry
            .map(|e| e.timestamp_millis().to_string())
            .unwrap_or_default();
        format!("{}:{}:{}", expiry, self.node_id, self.challenge)
    }

    fn topic(&self) -> &'static str {
        ZARIMAN_TOPIC
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("node".to_string(), self.node.clone());
        attrs.insert("node_id".to_string(), self.node_id.clone());
        attrs.insert("challenge".to_string(), self.challenge_name());
        attrs.insert("number".to_string(), self.number.to_string());
        attrs
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        self.rotation_expiry
    }

    fn summary(&self) -> String {
        format!("bounty {}: {} @ {}", self.number, self.challenge_name(), self.node)
    }
}

/// Challenge path with any difficulty suffix removed, e.g.
/// `.../ZarimanUseVoidRiftsEasyChallenge` -> `.../ZarimanUseVoidRiftsChallenge`.
pub fn normalize_challenge(path: &str) -> String {
    let (dir, file) = match path.rfind('/') {
        Some(i) => (&path[..=i], &path[i + 1..]),
        None => ("", path),
    };
    let (stem, tail) = match file.strip_suffix("Challenge") {
        Some(stem) => (stem, "Challenge"),
        None => (file, ""),
    };
    let stem = DIFFICULTY_SUFFIXES
        .iter()
        .find_map(|suffix| stem.strip_suffix(suffix))
        .unwrap_or(stem);
    format!("{}{}{}", dir, stem, tail)
}

/// `.../ZarimanUseVoidRiftsChallenge` -> `Use Void Rifts`
fn readable_challenge(path: &str) -> String {
    let file = path.rsplit('/').next().unwrap_or(path);
    let stem = file.strip_suffix("Challenge").unwrap_or(file);
    let stem = stem.strip_prefix("Zariman").unwrap_or(stem);

    let mut words = String::new();
    for (i, c) in stem.chars().enumerate() {
        if i > 0 && c.is_uppercase() {
            words.push(' ');
        }
        words.push(c);
    }
    if words.is_empty() {
        path.to_string()
    } else {
        words
    }
}

/// Target bounties in a bounty-cycle payload.
pub fn extract_bounties(
    payload: &Value,
    nodes: &NodeDirectory,
    target_node: &str,
    targets: &HashSet<String>,
) -> Option<Vec<ZarimanBounty>> {
    let bounties = payload.get("bounties")?;
    let rotation_expiry = payload.get("expiry").and_then(parse_mongo_date);
    let Some(list) = bounties.get(SYNDICATE).and_then(Value::as_array) else {
        debug!("No Zariman bounties in this rotation");
        return Some(Vec::new());
    };

    let entries = list
        .iter()
        .enumerate()
        .filter_map(|(index, raw)| {
            let number = index + 1;
            let node_id = str_field(raw, "node");
            if node_id != target_node {
                return None;
            }
            let challenge = str_field(raw, "challenge");
            if !targets.contains(&normalize_challenge(challenge)) {
                debug!(number, challenge, "Bounty challenge not targeted");
                return None;
            }
            Some(ZarimanBounty {
                number,
                node_id: node_id.to_string(),
                node: nodes.resolve(node_id).name,
                challenge: challenge.to_string(),
                rotation_expiry,
            })
        })
        .collect();
    Some(entries)
}

pub struct ZarimanBountyMonitor {
    target_node: String,
    targets: HashSet<String>,
    nodes: NodeDirectory,
    display_targets: Vec<String>,
}

impl ZarimanBountyMonitor {
    pub fn new(
        target_node: impl Into<String>,
        target_challenges: &[String],
        nodes: NodeDirectory,
        display_targets: Vec<String>,
    ) -> Self {
        Self {
            target_node: target_node.into(),
            targets: target_challenges
                .iter()
                .map(|c| normalize_challenge(c))
                .collect(),
            nodes,
            display_targets,
        }
    }

    fn message(bounty: &ZarimanBounty) -> String {
        let remaining = bounty
            .rotation_expiry
            .map(|e| format_remaining(e.signed_duration_since(Utc::now())))
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "Zariman bounty alert! (bounty {})\n\
             ================\n\
             Node: {}\n\
             Task: {}\n\
             Rotation ends in: {}\n\
             ================\n\
             Quick run, worth doing now!",
            bounty.number,
            bounty.node,
            bounty.challenge_name(),
            remaining
        )
    }
}

#[async_trait]
impl Monitor for ZarimanBountyMonitor {
    type Entry = ZarimanBounty;

    fn name(&self) -> &str {
        "zariman_bounty"
    }

    async fn fetch_data(&self, client: &WorldStateClient) -> CoreResult<FetchedEntries<ZarimanBounty>> {
        let snapshot = client.get_state(BOUNTY_CYCLE_PLATFORM).await?;
        let entries = extract_bounties(&snapshot.payload, &self.nodes, &self.target_node, &self.targets)
            .ok_or_else(|| CoreError::upstream(BOUNTY_CYCLE_PLATFORM, "payload has no bounties"))?;
        Ok(FetchedEntries {
            version: snapshot.version,
            entries,
        })
    }

    async fn on_new_entry(&self, entry: &ZarimanBounty) -> anyhow::Result<Vec<Notification>> {
        Ok(Notification::to_groups(&self.display_targets, &Self::message(entry)))
    }

    fn format_match(&self, entry: &ZarimanBounty, _owner: &MatchedOwner) -> anyhow::Result<String> {
        Ok(Self::message(entry))
    }
}
