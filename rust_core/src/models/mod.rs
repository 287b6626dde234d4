//! Shared data types: observable entries and outgoing notifications.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Comparable attribute fields of an entry, keyed by lowercase field name.
pub type Attributes = BTreeMap<String, String>;

/// One observable unit a monitor tracks (a fissure, a trader reminder, a
/// bounty). Change detection compares entries by `key()` only.
pub trait DomainEntry: Clone + Send + Sync + 'static {
    /// Stable identity across polls. Attribute changes must not alter it.
    fn key(&self) -> String;

    /// Subscription topic this entry is matched under.
    fn topic(&self) -> &'static str;

    fn attributes(&self) -> Attributes;

    fn expiry(&self) -> Option<DateTime<Utc>>;

    /// One-line human readable description.
    fn summary(&self) -> String;
}

/// Where a message goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryTarget {
    Group { group_id: String },
    /// A single user, mentioned inside `group_id` when present, otherwise
    /// messaged privately.
    User {
        user_id: String,
        group_id: Option<String>,
    },
}

impl DeliveryTarget {
    pub fn group(group_id: impl Into<String>) -> Self {
        DeliveryTarget::Group {
            group_id: group_id.into(),
        }
    }

    pub fn user(user_id: impl Into<String>, group_id: Option<String>) -> Self {
        DeliveryTarget::User {
            user_id: user_id.into(),
            group_id,
        }
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryTarget::Group { group_id } => write!(f, "group:{}", group_id),
            DeliveryTarget::User {
                user_id,
                group_id: Some(group_id),
            } => write!(f, "user:{}@group:{}", user_id, group_id),
            DeliveryTarget::User {
                user_id,
                group_id: None,
            } => write!(f, "user:{}", user_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub target: DeliveryTarget,
    pub message: String,
}

impl Notification {
    pub fn new(target: DeliveryTarget, message: impl Into<String>) -> Self {
        Self {
            target,
            message: message.into(),
        }
    }

    /// Same message fanned out to each group.
    pub fn to_groups(groups: &[String], message: &str) -> Vec<Notification> {
        groups
            .iter()
            .map(|g| Notification::new(DeliveryTarget::group(g.clone()), message))
            .collect()
    }
}
