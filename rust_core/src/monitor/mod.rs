//! Polling monitors.
//!
//! A [`Monitor`] supplies domain extraction and formatting for one category
//! of world-state events. [`MonitorEngine`] owns the loop, backoff, diffing,
//! matching, and delivery for any monitor.

pub mod backoff;
pub mod engine;
pub mod fissure;
pub mod nodes;
pub mod payload;
pub mod void_trader;
pub mod zariman;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::models::{DomainEntry, Notification};
use crate::subscriptions::MatchedOwner;
use crate::world_state::WorldStateClient;

pub use backoff::BackoffPolicy;
pub use engine::{CycleReport, MonitorContext, MonitorEngine, MonitorPhase, MonitorRunner, MonitorState};
pub use fissure::{FissureEntry, FissureMonitor};
pub use nodes::NodeDirectory;
pub use void_trader::{TraderReminder, VoidTraderMonitor};
pub use zariman::{ZarimanBounty, ZarimanBountyMonitor};

/// Entry set extracted from one snapshot
#[derive(Debug, Clone)]
pub struct FetchedEntries<E> {
    /// Version of the snapshot the entries came from
    pub version: u64,
    pub entries: Vec<E>,
}

/// Result of comparing two consecutive entry sets by key
#[derive(Debug, Clone)]
pub struct EntryDiff<E> {
    pub added: Vec<E>,
    pub removed: Vec<E>,
}

impl<E> EntryDiff<E> {
    pub fn empty() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference by identity key.
///
/// `added` keeps the order of `current`, `removed` is sorted by key.
/// Repeated keys within `current` count once.
pub fn diff_by_key<E: DomainEntry>(previous: &[E], current: &[E]) -> EntryDiff<E> {
    let previous_keys: HashSet<String> = previous.iter().map(|e| e.key()).collect();
    let current_keys: HashSet<String> = current.iter().map(|e| e.key()).collect();

    let mut seen = HashSet::new();
    let added = current
        .iter()
        .filter(|e| {
            let key = e.key();
            !previous_keys.contains(&key) && seen.insert(key)
        })
        .cloned()
        .collect();

    let mut removed: Vec<E> = previous
        .iter()
        .filter(|e| !current_keys.contains(&e.key()))
        .cloned()
        .collect();
    removed.sort_by_key(|e| e.key());
    removed.dedup_by_key(|e| e.key());

    EntryDiff { added, removed }
}

#[async_trait]
pub trait Monitor: Send + Sync + 'static {
    type Entry: DomainEntry;

    fn name(&self) -> &str;

    /// Pull the current entry set from the shared client.
    async fn fetch_data(&self, client: &WorldStateClient)
        -> CoreResult<FetchedEntries<Self::Entry>>;

    /// Compare against the previous entry set.
    fn process_data(
        &self,
        previous: &[Self::Entry],
        current: &[Self::Entry],
    ) -> anyhow::Result<EntryDiff<Self::Entry>> {
        Ok(diff_by_key(previous, current))
    }

    /// Display notifications for a newly added entry.
    async fn on_new_entry(&self, entry: &Self::Entry) -> anyhow::Result<Vec<Notification>>;

    /// Message sent to an owner whose criterion matched `entry`.
    fn format_match(&self, entry: &Self::Entry, _owner: &MatchedOwner) -> anyhow::Result<String> {
        Ok(format!("Subscription match: {}", entry.summary()))
    }
}
