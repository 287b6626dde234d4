//! Void fissure monitor.
//!
//! Reads `ActiveMissions` from the world state. A fissure is identified by
//! node, mission type, steel path flag, tier, and activation time, so the same
//! node reopening later counts as a new fissure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::nodes::NodeDirectory;
use super::payload::{format_remaining, parse_mongo_date, str_field};
use super::{FetchedEntries, Monitor};
use crate::error::{CoreError, CoreResult};
use crate::models::{Attributes, DomainEntry, Notification};
use crate::subscriptions::MatchedOwner;
use crate::world_state::WorldStateClient;

pub const FISSURE_TOPIC: &str = "fissure";

#[derive(Debug, Clone, PartialEq)]
pub struct FissureEntry {
    pub node_id: String,
    pub node: String,
    pub planet: String,
    /// Raw mission code such as `MT_EXTERMINATION`
    pub mission_code: String,
    pub mission_type: String,
    /// Raw tier code such as `VoidT4`
    pub tier_code: String,
    pub tier: String,
    pub hard: bool,
    pub activation: Option<DateTime<Utc>>,
    pub expiry: Option<DateTime<Utc>>,
}

impl FissureEntry {
    pub fn difficulty(&self) -> &'static str {
        if self.hard {
            "steel"
        } else {
            "normal"
        }
    }

    fn location(&self) -> String {
        if self.planet.is_empty() {
            self.node.clone()
        } else {
            format!("{} ({})", self.node, self.planet)
        }
    }

    fn time_left(&self) -> String {
        self.expiry
            .map(|expiry| format_remaining(expiry.signed_duration_since(Utc::now())))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl DomainEntry for FissureEntry {
    fn key(&self) -> String {
        let activation = self
            .activation
            .map(|a| a.timestamp_millis().to_string())
            .unwrap_or_default();
        format!(
            "{}_{}_{}_{}_{}",
            self.node_id, self.mission_code, self.hard, self.tier_code, activation
        )
    }

    fn topic(&self) -> &'static str {
        FISSURE_TOPIC
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("tier".to_string(), self.tier.clone());
        attrs.insert("tier_code".to_string(), self.tier_code.clone());
        attrs.insert("mission_type".to_string(), self.mission_type.clone());
        attrs.insert("mission_code".to_string(), self.mission_code.clone());
        attrs.insert("difficulty".to_string(), self.difficulty().to_string());
        attrs.insert("planet".to_string(), self.planet.clone());
        attrs.insert("node".to_string(), self.node.clone());
        attrs.insert("node_id".to_string(), self.node_id.clone());
        attrs
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    fn summary(&self) -> String {
        format!(
            "{} {} {} @ {}",
            self.tier,
            if self.hard { "Steel Path" } else { "Normal" },
            self.mission_type,
            self.location()
        )
    }
}

/// Friendly tier name for a `VoidT*` code.
pub fn tier_name(code: &str) -> String {
    match code {
        "VoidT1" => "Lith",
        "VoidT2" => "Meso",
        "VoidT3" => "Neo",
        "VoidT4" => "Axi",
        "VoidT5" => "Requiem",
        "VoidT6" => "Omnia",
        other => return other.replace("VoidT", "T"),
    }
    .to_string()
}

/// Friendly mission name for an `MT_*` code.
pub fn mission_name(code: &str) -> String {
    let known = match code {
        "MT_EXTERMINATION" => "Exterminate",
        "MT_SURVIVAL" => "Survival",
        "MT_DEFENSE" => "Defense",
        "MT_MOBILE_DEFENSE" => "Mobile Defense",
        "MT_CAPTURE" => "Capture",
        "MT_RESCUE" => "Rescue",
        "MT_SABOTAGE" => "Sabotage",
        "MT_INTEL" => "Spy",
        "MT_TERRITORY" => "Interception",
        "MT_EXCAVATE" => "Excavation",
        "MT_RETRIEVAL" => "Hijack",
        "MT_ASSASSINATION" => "Assassination",
        "MT_EVACUATION" => "Defection",
        "MT_ARENA" => "Rathuum",
        "MT_ARTIFACT" => "Disruption",
        "MT_ALCHEMY" => "Alchemy",
        "MT_CORRUPTION" => "Void Flood",
        "MT_VOID_CASCADE" => "Void Cascade",
        "MT_ENDLESS_CAPTURE" => "Void Armageddon",
        "MT_ASCENSION" => "Ascension",
        _ => "",
    };
    if !known.is_empty() {
        return known.to_string();
    }
    code.trim_start_matches("MT_")
        .split('_')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Active fissures in `payload` that have not expired at `now`.
pub fn extract_fissures(
    payload: &Value,
    nodes: &NodeDirectory,
    now: DateTime<Utc>,
) -> Option<Vec<FissureEntry>> {
    let missions = payload.get("ActiveMissions")?.as_array()?;
    let entries = missions
        .iter()
        .filter_map(|raw| {
            let node_id = str_field(raw, "Node");
            if node_id.is_empty() {
                debug!("Skipping fissure without node: {}", raw);
                return None;
            }
            let expiry = raw.get("Expiry").and_then(parse_mongo_date);
            if expiry.map_or(false, |e| e <= now) {
                return None;
            }
            let info = nodes.resolve(node_id);
            let mission_code = str_field(raw, "MissionType").to_string();
            let tier_code = str_field(raw, "Modifier").to_string();
            Some(FissureEntry {
                node_id: node_id.to_string(),
                node: info.name,
                planet: info.planet,
                mission_type: mission_name(&mission_code),
                mission_code,
                tier: tier_name(&tier_code),
                tier_code,
                hard: raw.get("Hard").and_then(Value::as_bool).unwrap_or(false),
                activation: raw.get("Activation").and_then(parse_mongo_date),
                expiry,
            })
        })
        .collect();
    Some(entries)
}

pub struct FissureMonitor {
    platform: String,
    nodes: NodeDirectory,
    display_targets: Vec<String>,
}

impl FissureMonitor {
    pub fn new(platform: impl Into<String>, nodes: NodeDirectory, display_targets: Vec<String>) -> Self {
        Self {
            platform: platform.into(),
            nodes,
            display_targets,
        }
    }
}

#[async_trait]
impl Monitor for FissureMonitor {
    type Entry = FissureEntry;

    fn name(&self) -> &str {
        "fissure"
    }

    async fn fetch_data(&self, client: &WorldStateClient) -> CoreResult<FetchedEntries<FissureEntry>> {
        let snapshot = client.get_state(&self.platform).await?;
        let entries = extract_fissures(&snapshot.payload, &self.nodes, Utc::now())
            .ok_or_else(|| CoreError::upstream(&self.platform, "payload has no ActiveMissions list"))?;
        Ok(FetchedEntries {
            version: snapshot.version,
            entries,
        })
    }

    async fn on_new_entry(&self, entry: &FissureEntry) -> anyhow::Result<Vec<Notification>> {
        if self.display_targets.is_empty() {
            return Ok(Vec::new());
        }
        let message = format!("New fissure: {} ({} left)", entry.summary(), entry.time_left());
        Ok(Notification::to_groups(&self.display_targets, &message))
    }

    fn format_match(&self, entry: &FissureEntry, _owner: &MatchedOwner) -> anyhow::Result<String> {
        Ok(format!(
            "Fissure subscription alert!\n\
             ================\n\
             A fissure you subscribed to is open:\n\
             - Mission: {}\n\
             - Difficulty: {}\n\
             - Tier: {}\n\
             - Location: {}\n\
             - Time left: {}",
            entry.mission_type,
            if entry.hard { "Steel Path" } else { "Normal" },
            entry.tier,
            entry.location(),
            entry.time_left()
        ))
    }
}
