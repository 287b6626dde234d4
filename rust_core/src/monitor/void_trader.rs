//! Void Trader arrival reminders.
//!
//! Each visit yields up to three reminder entries (1 day, 12 hours and 30
//! minutes before arrival), present only while the countdown is within five
//! minutes of the reminder point. Keys include the visit's activation time,
//! so a new visit re-arms every reminder.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::nodes::NodeDirectory;
use super::payload::{parse_mongo_date, str_field};
use super::{FetchedEntries, Monitor};
use crate::error::{CoreError, CoreResult};
use crate::models::{Attributes, DomainEntry, Notification};
use crate::subscriptions::MatchedOwner;
use crate::world_state::WorldStateClient;

pub const VOID_TRADER_TOPIC: &str = "void_trader";

/// Minutes before arrival, with their display label.
pub const REMINDER_POINTS: &[(i64, &str)] = &[(1440, "1d"), (720, "12h"), (30, "30m")];

/// Tolerance around each reminder point, in minutes.
pub const REMINDER_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct TraderReminder {
    pub character: String,
    pub node_id: String,
    pub node: String,
    pub activation: DateTime<Utc>,
    pub expiry: Option<DateTime<Utc>>,
    pub lead_minutes: i64,
    pub lead_label: &'static str,
}

impl DomainEntry for TraderReminder {
    fn key(&self) -> String {
        format!("{}:{}", self.activation.timestamp_millis(), self.lead_minutes)
    }

    fn topic(&self) -> &'static str {
        VOID_TRADER_TOPIC
    }

    fn attributes(&self) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.insert("lead".to_string(), self.lead_label.to_string());
        attrs.insert("character".to_string(), self.character.clone());
        attrs.insert("node".to_string(), self.node.clone());
        attrs.insert("node_id".to_string(), self.node_id.clone());
        attrs
    }

    fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expiry
    }

    fn summary(&self) -> String {
        format!(
            "{} arrives at {} in {}",
            self.character, self.node, self.lead_label
        )
    }
}

/// Reminders due at `now` for the first trader in `payload`.
///
/// `None` means the payload has no `VoidTraders` list at all; an empty list
/// or an unparseable activation yields no reminders.
pub fn due_reminders(
    payload: &Value,
    nodes: &NodeDirectory,
    now: DateTime<Utc>,
) -> Option<Vec<TraderReminder>> {
    let traders = payload.get("VoidTraders")?.as_array()?;
    let Some(trader) = traders.first() else {
        debug!("No void trader scheduled");
        return Some(Vec::new());
    };
    let Some(activation) = trader.get("Activation").and_then(parse_mongo_date) else {
        debug!("Void trader activation missing or unparseable");
        return Some(Vec::new());
    };

    let minutes_to_arrival = activation.signed_duration_since(now).num_minutes();
    let character = match str_field(trader, "Character") {
        "" => "Baro Ki'Teer".to_string(),
        name => name.to_string(),
    };
    let node_id = str_field(trader, "Node").to_string();
    let node = nodes.resolve(&node_id).name;
    let expiry = trader.get("Expiry").and_then(parse_mongo_date);

    let reminders = REMINDER_POINTS
        .iter()
        .filter(|(lead, _)| (minutes_to_arrival - lead).abs() <= REMINDER_WINDOW_MINUTES)
        .map(|&(lead_minutes, lead_label)| TraderReminder {
            character: character.clone(),
            node_id: node_id.clone(),
            node: node.clone(),
            activation,
            expiry,
            lead_minutes,
            lead_label,
        })
        .collect();
    Some(reminders)
}

pub struct VoidTraderMonitor {
    platform: String,
    nodes: NodeDirectory,
    display_targets: Vec<String>,
}

impl VoidTraderMonitor {
    pub fn new(platform: impl Into<String>, nodes: NodeDirectory, display_targets: Vec<String>) -> Self {
        Self {
            platform: platform.into(),
            nodes,
            display_targets,
        }
    }

    fn message(reminder: &TraderReminder) -> String {
        format!(
            "The Void Trader is coming!\n\
             ================\n\
             Trader: {}\n\
             Location: {}\n\
             Arrival: {}\n\
             Countdown: {}\n\
             ================\n\
             Get your Ducats and Credits ready!",
            reminder.character,
            reminder.node,
            reminder.activation.format("%Y-%m-%d %H:%M:%S UTC"),
            reminder.lead_label
        )
    }
}

#[async_trait]
impl Monitor for VoidTraderMonitor {
    type Entry = TraderReminder;

    fn name(&self) -> &str {
        "void_trader"
    }

    async fn fetch_data(&self, client: &WorldStateClient) -> CoreResult<FetchedEntries<TraderReminder>> {
        let snapshot = client.get_state(&self.platform).await?;
        let entries = due_reminders(&snapshot.payload, &self.nodes, Utc::now())
            .ok_or_else(|| CoreError::upstream(&self.platform, "payload has no VoidTraders list"))?;
        Ok(FetchedEntries {
            version: snapshot.version,
            entries,
        })
    }

    async fn on_new_entry(&self, entry: &TraderReminder) -> anyhow::Result<Vec<Notification>> {
        Ok(Notification::to_groups(&self.display_targets, &Self::message(entry)))
    }

    fn format_match(&self, entry: &TraderReminder, _owner: &MatchedOwner) -> anyhow::Result<String> {
        Ok(Self::message(entry))
    }
}
