//! Per-owner subscription criteria and matching.
//!
//! Criteria are kept in creation order. Each mutation is written through the
//! [`SubscriptionStore`] immediately; a failed save is logged and the
//! in-memory change stands. Saves run outside the criteria lock, serialized
//! by their own lock so they land in mutation order.

pub mod store;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::SubscriptionError;
use crate::models::{Attributes, DomainEntry};

pub use store::{InMemorySubscriptionStore, JsonFileSubscriptionStore, SubscriptionStore};

/// Values that mean "any" when supplied as a constraint.
const WILDCARDS: &[&str] = &["all", "any", "both", "*"];

/// Ordered set of field constraints. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldConstraints(BTreeMap<String, String>);

impl FieldConstraints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a constraint. Field names are lowercased; empty values and
    /// wildcard words leave the field unset.
    pub fn with(mut self, field: &str, value: &str) -> Self {
        self.set(field, Some(value));
        self
    }

    pub fn set(&mut self, field: &str, value: Option<&str>) {
        let field = field.trim().to_lowercase();
        match value.map(str::trim) {
            Some(v) if !v.is_empty() && !is_wildcard(v) => {
                self.0.insert(field, v.to_string());
            }
            _ => {
                self.0.remove(&field);
            }
        }
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff every set field equals the entry's field (ASCII
    /// case-insensitive). A field the entry lacks never matches.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.0.iter().all(|(field, wanted)| {
            attributes
                .get(field)
                .map_or(false, |actual| actual.trim().eq_ignore_ascii_case(wanted))
        })
    }

    /// Same constraint set, ignoring value case.
    fn same_as(&self, other: &FieldConstraints) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|((fa, va), (fb, vb))| fa == fb && va.eq_ignore_ascii_case(vb))
    }
}

fn is_wildcard(value: &str) -> bool {
    WILDCARDS.iter().any(|w| value.eq_ignore_ascii_case(w))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCriterion {
    pub id: Uuid,
    pub owner_id: String,
    /// Group to mention the owner in; `None` means a private message
    #[serde(default)]
    pub group_id: Option<String>,
    pub topic: String,
    pub constraints: FieldConstraints,
    pub created_at: DateTime<Utc>,
}

/// How `unsubscribe` picks the criterion to remove
#[derive(Debug, Clone)]
pub enum CriterionSelector {
    Id(Uuid),
    Constraints {
        topic: String,
        constraints: FieldConstraints,
    },
}

/// An owner whose criterion matched a new entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedOwner {
    pub owner_id: String,
    pub group_id: Option<String>,
    pub criterion_id: Uuid,
}

pub struct SubscriptionMatcher {
    criteria: RwLock<Vec<SubscriptionCriterion>>,
    store: Arc<dyn SubscriptionStore>,
    save_lock: Mutex<()>,
    max_per_owner: usize,
}

impl std::fmt::Debug for SubscriptionMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionMatcher")
            .field("criteria", &self.criteria.read().len())
            .field("max_per_owner", &self.max_per_owner)
            .finish()
    }
}

impl SubscriptionMatcher {
    /// Empty matcher; nothing is read from `store`.
    pub fn new(store: Arc<dyn SubscriptionStore>, max_per_owner: usize) -> Self {
        Self {
            criteria: RwLock::new(Vec::new()),
            store,
            save_lock: Mutex::new(()),
            max_per_owner,
        }
    }

    /// Matcher seeded from `store`. A load failure is logged and yields an
    /// empty set rather than aborting startup.
    pub fn load(store: Arc<dyn SubscriptionStore>, max_per_owner: usize) -> Self {
        let matcher = Self::new(store, max_per_owner);
        match matcher.store.load_all() {
            Ok(mut criteria) => {
                criteria.sort_by_key(|c| c.created_at);
                info!("Loaded {} subscription criteria", criteria.len());
                *matcher.criteria.write() = criteria;
            }
            Err(e) => error!("Failed to load subscriptions, starting empty: {:#}", e),
        }
        matcher
    }

    /// Add a criterion for `owner_id`, returning its id.
    ///
    /// The quota is checked first, so an owner at the limit always gets
    /// `QuotaExceeded` whatever the new criterion looks like.
    pub fn subscribe(
        &self,
        owner_id: &str,
        group_id: Option<&str>,
        topic: &str,
        constraints: FieldConstraints,
    ) -> Result<Uuid, SubscriptionError> {
        let _saving = self.save_lock.lock();
        let mut criteria = self.criteria.write();

        let owned = criteria.iter().filter(|c| c.owner_id == owner_id).count();
        if owned >= self.max_per_owner {
            warn!(owner_id, limit = self.max_per_owner, "Subscription quota reached");
            return Err(SubscriptionError::QuotaExceeded {
                owner_id: owner_id.to_string(),
                limit: self.max_per_owner,
            });
        }
        if constraints.is_empty() {
            return Err(SubscriptionError::EmptyCriterion);
        }
        let duplicate = criteria
            .iter()
            .find(|c| {
                c.owner_id == owner_id && c.topic == topic && c.constraints.same_as(&constraints)
            })
            .map(|c| c.id);
        if let Some(existing) = duplicate {
            return Err(SubscriptionError::DuplicateCriterion {
                owner_id: owner_id.to_string(),
                existing,
            });
        }

        let criterion = SubscriptionCriterion {
            id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            group_id: group_id.map(str::to_string),
            topic: topic.to_string(),
            constraints,
            created_at: Utc::now(),
        };
        let id = criterion.id;
        info!(owner_id, topic, criterion = %id, "Subscription added: {:?}", criterion.constraints);
        criteria.push(criterion);
        let snapshot = criteria.clone();
        drop(criteria);
        self.persist(&snapshot);
        Ok(id)
    }

    /// Remove one criterion of `owner_id`.
    pub fn unsubscribe(
        &self,
        owner_id: &str,
        selector: &CriterionSelector,
    ) -> Result<SubscriptionCriterion, SubscriptionError> {
        let _saving = self.save_lock.lock();
        let mut criteria = self.criteria.write();
        let position = criteria.iter().position(|c| {
            c.owner_id == owner_id
                && match selector {
                    CriterionSelector::Id(id) => c.id == *id,
                    CriterionSelector::Constraints { topic, constraints } => {
                        c.topic == *topic && c.constraints.same_as(constraints)
                    }
                }
        });

        match position {
            Some(index) => {
                let removed = criteria.remove(index);
                info!(owner_id, criterion = %removed.id, "Subscription removed");
                let snapshot = criteria.clone();
                drop(criteria);
                self.persist(&snapshot);
                Ok(removed)
            }
            None => Err(SubscriptionError::NotFound {
                owner_id: owner_id.to_string(),
            }),
        }
    }

    /// Remove every criterion of `owner_id`.
    pub fn remove_all_for_owner(
        &self,
        owner_id: &str,
    ) -> Result<Vec<SubscriptionCriterion>, SubscriptionError> {
        let _saving = self.save_lock.lock();
        let mut criteria = self.criteria.write();
        let (removed, kept): (Vec<_>, Vec<_>) =
            criteria.drain(..).partition(|c| c.owner_id == owner_id);
        *criteria = kept;

        if removed.is_empty() {
            return Err(SubscriptionError::NotFound {
                owner_id: owner_id.to_string(),
            });
        }
        info!(owner_id, count = removed.len(), "Removed all subscriptions for owner");
        let snapshot = criteria.clone();
        drop(criteria);
        self.persist(&snapshot);
        Ok(removed)
    }

    /// Owners whose criteria match a newly added entry, one per owner, in
    /// the creation order of their first matching criterion. An entry that
    /// has already expired matches nobody.
    pub fn match_entry<E: DomainEntry>(&self, entry: &E) -> Vec<MatchedOwner> {
        if entry.expiry().map_or(false, |at| at <= Utc::now()) {
            debug!(entry = %entry.key(), "Entry already expired, not matching");
            return Vec::new();
        }
        let topic = entry.topic();
        let attributes = entry.attributes();
        let criteria = self.criteria.read();

        let mut matched: Vec<MatchedOwner> = Vec::new();
        for criterion in criteria.iter() {
            if criterion.topic != topic || !criterion.constraints.matches(&attributes) {
                continue;
            }
            if matched.iter().any(|m| m.owner_id == criterion.owner_id) {
                continue;
            }
            matched.push(MatchedOwner {
                owner_id: criterion.owner_id.clone(),
                group_id: criterion.group_id.clone(),
                criterion_id: criterion.id,
            });
        }
        matched
    }

    pub fn list_for_owner(&self, owner_id: &str) -> Vec<SubscriptionCriterion> {
        self.criteria
            .read()
            .iter()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.criteria.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.criteria.read().is_empty()
    }

    fn persist(&self, criteria: &[SubscriptionCriterion]) {
        if let Err(e) = self.store.save_all(criteria) {
            error!(
                "Failed to persist {} subscriptions (in-memory state kept): {:#}",
                criteria.len(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct TestEntry(Attributes, Option<DateTime<Utc>>);

    impl TestEntry {
        fn new(pairs: &[(&str, &str)]) -> Self {
            TestEntry(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                None,
            )
        }

        fn expiring(mut self, at: DateTime<Utc>) -> Self {
            self.1 = Some(at);
            self
        }
    }

    impl DomainEntry for TestEntry {
        fn key(&self) -> String {
            format!("{:?}", self.0)
        }
        fn topic(&self) -> &'static str {
            "fissure"
        }
        fn attributes(&self) -> Attributes {
            self.0.clone()
        }
        fn expiry(&self) -> Option<DateTime<Utc>> {
            self.1
        }
        fn summary(&self) -> String {
            self.key()
        }
    }

    fn matcher(limit: usize) -> (SubscriptionMatcher, Arc<InMemorySubscriptionStore>) {
        let store = Arc::new(InMemorySubscriptionStore::new());
        (SubscriptionMatcher::new(store.clone(), limit), store)
    }

    #[test]
    fn test_sixth_subscription_hits_quota() {
        let (matcher, _) = matcher(5);
        for tier in ["Lith", "Meso", "Neo", "Axi", "Requiem"] {
            matcher
                .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", tier))
                .unwrap();
        }
        // Same content as an existing one: quota still wins
        let err = matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Lith"))
            .unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::QuotaExceeded {
                owner_id: "alice".to_string(),
                limit: 5
            }
        );
        // Other owners are unaffected
        assert!(matcher
            .subscribe("bob", None, "fissure", FieldConstraints::new().with("tier", "Lith"))
            .is_ok());
    }

    #[test]
    fn test_duplicate_rejected() {
        let (matcher, _) = matcher(5);
        let first = matcher
            .subscribe(
                "alice",
                Some("g1"),
                "fissure",
                FieldConstraints::new().with("tier", "Axi").with("planet", "Void"),
            )
            .unwrap();
        let err = matcher
            .subscribe(
                "alice",
                Some("g1"),
                "fissure",
                FieldConstraints::new().with("planet", "void").with("tier", "AXI"),
            )
            .unwrap_err();
        assert_eq!(
            err,
            SubscriptionError::DuplicateCriterion {
                owner_id: "alice".to_string(),
                existing: first
            }
        );
    }

    #[test]
    fn test_wildcards_leave_field_unset() {
        let constraints = FieldConstraints::new()
            .with("tier", "all")
            .with("difficulty", "both")
            .with("Mission_Type", "Defense");
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints.get("mission_type"), Some("Defense"));
    }

    #[test]
    fn test_empty_criterion_rejected() {
        let (matcher, _) = matcher(5);
        let err = matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "any"))
            .unwrap_err();
        assert_eq!(err, SubscriptionError::EmptyCriterion);
    }

    #[test]
    fn test_matching_is_independent_per_owner() {
        let (matcher, _) = matcher(5);
        matcher
            .subscribe("A", None, "fissure", FieldConstraints::new().with("tier", "Hard"))
            .unwrap();
        matcher
            .subscribe("B", None, "fissure", FieldConstraints::new().with("type", "Capture"))
            .unwrap();

        let entry = TestEntry::new(&[("tier", "Hard"), ("type", "Exterminate"), ("planet", "Void")]);
        let owners: Vec<String> = matcher
            .match_entry(&entry)
            .into_iter()
            .map(|m| m.owner_id)
            .collect();
        assert_eq!(owners, vec!["A"]);
    }

    #[test]
    fn test_one_match_per_owner_in_creation_order() {
        let (matcher, _) = matcher(5);
        matcher
            .subscribe("B", None, "fissure", FieldConstraints::new().with("planet", "Void"))
            .unwrap();
        let a_first = matcher
            .subscribe("A", None, "fissure", FieldConstraints::new().with("tier", "Axi"))
            .unwrap();
        matcher
            .subscribe("A", None, "fissure", FieldConstraints::new().with("planet", "Void"))
            .unwrap();
        matcher
            .subscribe("C", None, "void_trader", FieldConstraints::new().with("planet", "Void"))
            .unwrap();

        let entry = TestEntry::new(&[("tier", "Axi"), ("planet", "Void")]);
        let matched = matcher.match_entry(&entry);
        let owners: Vec<&str> = matched.iter().map(|m| m.owner_id.as_str()).collect();
        assert_eq!(owners, vec!["B", "A"]);
        assert_eq!(matched[1].criterion_id, a_first);
    }

    #[test]
    fn test_missing_attribute_never_matches() {
        let constraints = FieldConstraints::new().with("node", "Cordelia");
        let entry = TestEntry::new(&[("tier", "Axi")]);
        assert!(!constraints.matches(&entry.attributes()));
    }

    #[test]
    fn test_unsubscribe_by_id_and_constraints() {
        let (matcher, store) = matcher(5);
        let id = matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Neo"))
            .unwrap();
        matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Axi"))
            .unwrap();

        let removed = matcher
            .unsubscribe("alice", &CriterionSelector::Id(id))
            .unwrap();
        assert_eq!(removed.id, id);

        matcher
            .unsubscribe(
                "alice",
                &CriterionSelector::Constraints {
                    topic: "fissure".to_string(),
                    constraints: FieldConstraints::new().with("tier", "axi"),
                },
            )
            .unwrap();
        assert!(matcher.is_empty());
        assert!(store.saved().is_empty());
        assert_eq!(store.save_count(), 4);

        let err = matcher
            .unsubscribe("alice", &CriterionSelector::Id(id))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::NotFound { .. }));
    }

    #[test]
    fn test_unsubscribe_other_owner_is_not_found() {
        let (matcher, _) = matcher(5);
        let id = matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Neo"))
            .unwrap();
        assert!(matcher
            .unsubscribe("mallory", &CriterionSelector::Id(id))
            .is_err());
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn test_remove_all_for_owner() {
        let (matcher, _) = matcher(5);
        for tier in ["Lith", "Meso"] {
            matcher
                .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", tier))
                .unwrap();
        }
        matcher
            .subscribe("bob", None, "fissure", FieldConstraints::new().with("tier", "Lith"))
            .unwrap();

        assert_eq!(matcher.remove_all_for_owner("alice").unwrap().len(), 2);
        assert_eq!(matcher.list_for_owner("bob").len(), 1);
        assert!(matcher.remove_all_for_owner("alice").is_err());
    }

    #[test]
    fn test_save_failure_keeps_memory_state() {
        let (matcher, store) = matcher(5);
        store.fail_saves(true);
        matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Neo"))
            .unwrap();
        assert_eq!(matcher.len(), 1);
        assert!(store.saved().is_empty());
    }

    #[test]
    fn test_load_restores_creation_order() {
        let stored = |owner: &str, minutes_ago: i64| SubscriptionCriterion {
            id: Uuid::new_v4(),
            owner_id: owner.to_string(),
            group_id: None,
            topic: "fissure".to_string(),
            constraints: FieldConstraints::new().with("tier", "Neo"),
            created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        };
        // File order differs from creation order
        let store = Arc::new(InMemorySubscriptionStore::with_criteria(vec![
            stored("y", 5),
            stored("x", 10),
        ]));

        let reloaded = SubscriptionMatcher::load(store, 5);
        let owners: Vec<String> = reloaded
            .match_entry(&TestEntry::new(&[("tier", "neo")]))
            .into_iter()
            .map(|m| m.owner_id)
            .collect();
        assert_eq!(owners, vec!["x", "y"]);
    }

    #[test]
    fn test_expired_entry_matches_nobody() {
        let (matcher, _) = matcher(5);
        matcher
            .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Axi"))
            .unwrap();

        let entry = TestEntry::new(&[("tier", "Axi")]);
        let past = entry.clone().expiring(Utc::now() - chrono::Duration::minutes(1));
        let future = entry.expiring(Utc::now() + chrono::Duration::minutes(30));
        assert!(matcher.match_entry(&past).is_empty());
        assert_eq!(matcher.match_entry(&future).len(), 1);
    }

    /// Store whose saves park until the test lets them through.
    struct GatedStore {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl SubscriptionStore for GatedStore {
        fn load_all(&self) -> anyhow::Result<Vec<SubscriptionCriterion>> {
            Ok(Vec::new())
        }

        fn save_all(&self, _criteria: &[SubscriptionCriterion]) -> anyhow::Result<()> {
            self.entered.lock().send(())?;
            self.release.lock().recv()?;
            Ok(())
        }
    }

    #[test]
    fn test_matching_is_not_blocked_by_a_slow_save() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let matcher = Arc::new(SubscriptionMatcher::new(
            Arc::new(GatedStore {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
            5,
        ));

        let writer = std::thread::spawn({
            let matcher = matcher.clone();
            move || {
                matcher
                    .subscribe("alice", None, "fissure", FieldConstraints::new().with("tier", "Axi"))
                    .unwrap()
            }
        });
        entered_rx.recv().unwrap();

        // The save is parked; readers see the new criterion already
        assert!(matcher.criteria.try_read().is_some());
        assert_eq!(matcher.match_entry(&TestEntry::new(&[("tier", "axi")])).len(), 1);
        assert_eq!(matcher.list_for_owner("alice").len(), 1);

        release_tx.send(()).unwrap();
        writer.join().unwrap();
        assert_eq!(matcher.len(), 1);
    }
}
