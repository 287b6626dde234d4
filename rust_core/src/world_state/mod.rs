//! Shared world-state client.
//!
//! One instance is built at startup and handed to every monitor. It owns:
//! - the TTL cache of snapshots, keyed by platform
//! - the last good snapshot per platform (served as stale data on failure)
//! - the in-flight fetch table that collapses concurrent misses into one
//!   upstream request per platform
//! - the change listeners and the broadcast change channel

pub mod http;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::config::WorldStateConfig;
use crate::error::{CoreError, CoreResult};

pub use http::HttpWorldStateFetcher;

/// Capacity of the broadcast change channel.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Immutable upstream payload for one platform at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct WorldStateSnapshot {
    pub platform: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    /// Strictly increasing across every snapshot this client produces
    pub version: u64,
}

/// Opaque, possibly slow, possibly failing upstream call.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(&self, platform: &str) -> anyhow::Result<Value>;
}

/// Callback notified after every successful fetch.
#[async_trait]
pub trait WorldStateListener: Send + Sync {
    async fn on_snapshot(&self, snapshot: Arc<WorldStateSnapshot>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

/// Point-in-time view of the cache for one platform
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub platform: String,
    pub has_snapshot: bool,
    pub version: Option<u64>,
    pub age_secs: Option<i64>,
    pub ttl_secs: u64,
    pub is_valid: bool,
    pub listener_count: usize,
}

/// Result a leading fetch hands to the callers that joined it.
#[derive(Debug, Clone)]
struct FetchOutcome {
    result: CoreResult<Arc<WorldStateSnapshot>>,
    /// False when the leader found the cache already refilled
    from_upstream: bool,
}

type InFlightTable = Mutex<HashMap<String, watch::Receiver<Option<FetchOutcome>>>>;

pub struct WorldStateClient {
    fetcher: Arc<dyn UpstreamFetcher>,
    cache: TtlCache<Arc<WorldStateSnapshot>>,
    cache_ttl: Duration,
    listener_timeout: Duration,
    last_good: RwLock<HashMap<String, Arc<WorldStateSnapshot>>>,
    in_flight: InFlightTable,
    next_version: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn WorldStateListener>)>>,
    changes: broadcast::Sender<Arc<WorldStateSnapshot>>,
}

impl std::fmt::Debug for WorldStateClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStateClient")
            .field("cache_ttl", &self.cache_ttl)
            .field("cached_platforms", &self.cache.len())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl WorldStateClient {
    pub fn new(fetcher: Arc<dyn UpstreamFetcher>, config: &WorldStateConfig) -> Self {
        Self::with_ttl(fetcher, config.cache_ttl, config.listener_timeout)
    }

    pub fn with_ttl(
        fetcher: Arc<dyn UpstreamFetcher>,
        cache_ttl: Duration,
        listener_timeout: Duration,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            fetcher,
            cache: TtlCache::new(),
            cache_ttl,
            listener_timeout,
            last_good: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_version: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
            changes,
        }
    }

    /// Current snapshot for `platform`.
    ///
    /// A cache hit costs no network call. On a miss exactly one upstream
    /// fetch runs per platform; concurrent callers wait for and share its
    /// result. A failed fetch returns `UpstreamUnavailable` carrying the last
    /// good snapshot, if one exists.
    pub async fn get_state(&self, platform: &str) -> CoreResult<Arc<WorldStateSnapshot>> {
        if let Some(snapshot) = self.cache.get(platform) {
            debug!(platform, version = snapshot.version, "World state cache hit");
            return Ok(snapshot);
        }
        self.fetch_shared(platform, false).await
    }

    /// Fetch regardless of TTL.
    ///
    /// Joins a fetch that is already in flight when that fetch goes upstream.
    /// If the joined fetch was answered from the cache instead, the refresh
    /// runs its own upstream call.
    pub async fn force_refresh(&self, platform: &str) -> CoreResult<Arc<WorldStateSnapshot>> {
        self.fetch_shared(platform, true).await
    }

    /// Drop the cached snapshot so the next `get_state` goes upstream.
    /// The last good snapshot is kept for stale fallback.
    pub fn invalidate(&self, platform: &str) -> bool {
        self.cache.invalidate(platform)
    }

    /// Last successfully fetched snapshot, whether or not it is still fresh.
    pub fn latest(&self, platform: &str) -> Option<Arc<WorldStateSnapshot>> {
        self.last_good.read().get(platform).cloned()
    }

    pub fn cache_info(&self, platform: &str) -> CacheInfo {
        let latest = self.latest(platform);
        CacheInfo {
            platform: platform.to_string(),
            has_snapshot: latest.is_some(),
            version: latest.as_ref().map(|s| s.version),
            age_secs: latest
                .as_ref()
                .map(|s| Utc::now().signed_duration_since(s.fetched_at).num_seconds()),
            ttl_secs: self.cache_ttl.as_secs(),
            is_valid: self.cache.ttl_remaining(platform).is_some(),
            listener_count: self.listeners.read().len(),
        }
    }

    pub fn subscribe(&self, listener: Arc<dyn WorldStateListener>) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Receiver of every new snapshot, across all platforms.
    pub fn changes(&self) -> broadcast::Receiver<Arc<WorldStateSnapshot>> {
        self.changes.subscribe()
    }

    async fn fetch_shared(
        &self,
        platform: &str,
        force: bool,
    ) -> CoreResult<Arc<WorldStateSnapshot>> {
        loop {
            let (mut rx, leader) = {
                let mut in_flight = self.in_flight.lock();
                match in_flight.get(platform) {
                    Some(rx) => (rx.clone(), None),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(platform.to_string(), rx.clone());
                        (rx, Some(tx))
                    }
                }
            };

            if let Some(tx) = leader {
                let slot = InFlightSlot {
                    table: &self.in_flight,
                    platform,
                };
                // A previous leader may have filled the cache between our
                // miss and taking the slot.
                let outcome = match self.cache.get(platform).filter(|_| !force) {
                    Some(snapshot) => FetchOutcome {
                        result: Ok(snapshot),
                        from_upstream: false,
                    },
                    None => FetchOutcome {
                        result: self.fetch_and_store(platform).await,
                        from_upstream: true,
                    },
                };
                drop(slot);
                let result = outcome.result.clone();
                let _ = tx.send(Some(outcome));
                return result;
            }

            debug!(platform, "Joining in-flight world state fetch");
            match wait_for_leader(&mut rx).await {
                Some(outcome) if force && !outcome.from_upstream => {
                    debug!(platform, "Joined fetch was a cache hit, refreshing");
                }
                Some(outcome) => return outcome.result,
                None => {
                    return Err(CoreError::UpstreamUnavailable {
                        platform: platform.to_string(),
                        reason: "in-flight fetch was abandoned".to_string(),
                        stale: self.latest(platform),
                    })
                }
            }
        }
    }

    async fn fetch_and_store(&self, platform: &str) -> CoreResult<Arc<WorldStateSnapshot>> {
        info!(platform, "Fetching world state from upstream");
        match self.fetcher.fetch(platform).await {
            Ok(payload) => {
                let snapshot = Arc::new(WorldStateSnapshot {
                    platform: platform.to_string(),
                    payload,
                    fetched_at: Utc::now(),
                    version: self.next_version.fetch_add(1, Ordering::SeqCst),
                });
                self.cache.set(platform, snapshot.clone(), self.cache_ttl);
                self.last_good
                    .write()
                    .insert(platform.to_string(), snapshot.clone());
                info!(platform, version = snapshot.version, "World state updated");
                self.notify(&snapshot);
                Ok(snapshot)
            }
            Err(e) => {
                let stale = self.latest(platform);
                warn!(
                    platform,
                    has_stale = stale.is_some(),
                    "World state fetch failed: {:#}",
                    e
                );
                Err(CoreError::UpstreamUnavailable {
                    platform: platform.to_string(),
                    reason: format!("{:#}", e),
                    stale,
                })
            }
        }
    }

    /// Fan out to listeners without blocking the fetch path. Each callback
    /// runs on its own task and is cut off after `listener_timeout`.
    fn notify(&self, snapshot: &Arc<WorldStateSnapshot>) {
        let _ = self.changes.send(snapshot.clone());

        let listeners: Vec<_> = self.listeners.read().iter().cloned().collect();
        for (id, listener) in listeners {
            let snapshot = snapshot.clone();
            let timeout = self.listener_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(timeout, listener.on_snapshot(snapshot)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(listener = ?id, "World state listener failed: {:#}", e),
                    Err(_) => warn!(listener = ?id, "World state listener timed out after {:?}", timeout),
                }
            });
        }
    }
}

/// Outcome published by the leader, or `None` if it was dropped first.
async fn wait_for_leader(rx: &mut watch::Receiver<Option<FetchOutcome>>) -> Option<FetchOutcome> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Some(outcome);
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
    }
}

/// Clears the platform's in-flight entry when the leading fetch finishes or
/// is dropped, so followers never wait on a dead slot.
struct InFlightSlot<'a> {
    table: &'a InFlightTable,
    platform: &'a str,
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(self.platform);
    }
}
