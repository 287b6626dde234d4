//! Worldstate Core - shared polling, change detection and subscription matching.
//!
//! This crate provides:
//! - A TTL cache and a shared world-state client with per-platform fetch
//!   deduplication and stale-if-error fallback
//! - A generic monitor engine (poll, diff by key, backoff, start/stop)
//! - Per-owner subscription criteria with quota and duplicate checks
//! - Fissure, Void Trader and Zariman bounty monitors
//! - The notification sink seam used by the services

pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod monitor;
pub mod sink;
pub mod subscriptions;
pub mod world_state;

pub use cache::TtlCache;
pub use config::{CoreConfig, MonitorConfig, WorldStateConfig};
pub use error::{guard, guard_sync, CoreError, CoreResult, SubscriptionError};
pub use models::{Attributes, DeliveryTarget, DomainEntry, Notification};
pub use monitor::{
    diff_by_key, BackoffPolicy, CycleReport, EntryDiff, FetchedEntries, Monitor, MonitorContext,
    MonitorEngine, MonitorPhase, MonitorRunner,
};
pub use sink::{LogSink, NotificationSink};
pub use subscriptions::{
    CriterionSelector, FieldConstraints, MatchedOwner, SubscriptionCriterion, SubscriptionMatcher,
};
pub use world_state::{
    CacheInfo, HttpWorldStateFetcher, UpstreamFetcher, WorldStateClient, WorldStateListener,
    WorldStateSnapshot,
};
