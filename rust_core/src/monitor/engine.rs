//! Generic polling loop shared by every monitor.
//!
//! A cycle runs fetch, diff, per-entry hooks, and subscription matching,
//! then records the fetched set as `last_seen`. Cycles of one monitor never
//! overlap. `stop()` is observed between cycles only, so an upstream fetch is
//! always allowed to finish.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BackoffPolicy, EntryDiff, Monitor};
use crate::config::MonitorConfig;
use crate::error::{guard, guard_sync};
use crate::models::{DeliveryTarget, DomainEntry, Notification};
use crate::sink::NotificationSink;
use crate::subscriptions::SubscriptionMatcher;
use crate::world_state::WorldStateClient;

/// Shared collaborators handed to every monitor at startup
#[derive(Clone)]
pub struct MonitorContext {
    pub client: Arc<WorldStateClient>,
    pub matcher: Arc<SubscriptionMatcher>,
    pub sink: Arc<dyn NotificationSink>,
}

impl MonitorContext {
    pub fn new(
        client: Arc<WorldStateClient>,
        matcher: Arc<SubscriptionMatcher>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            client,
            matcher,
            sink,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Mutable loop state, owned by exactly one runner.
#[derive(Debug, Clone)]
pub struct MonitorState<E> {
    pub last_seen: Vec<E>,
    pub last_seen_version: Option<u64>,
    pub consecutive_failures: u32,
    pub current_interval: Duration,
}

/// What one cycle did
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Snapshot version processed, `None` when the fetch failed
    pub version: Option<u64>,
    pub fetch_error: Option<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub matched_owners: usize,
    pub delivered: usize,
    pub failed_deliveries: usize,
    pub failed_entries: usize,
    pub next_interval: Duration,
}

impl CycleReport {
    pub fn fetch_failed(&self) -> bool {
        self.fetch_error.is_some()
    }
}

/// A monitor plus its state and collaborators. Runs single cycles; the
/// engine drives it on a timer.
pub struct MonitorRunner<M: Monitor> {
    monitor: M,
    ctx: MonitorContext,
    backoff: BackoffPolicy,
    state: MonitorState<M::Entry>,
}

impl<M: Monitor> MonitorRunner<M> {
    pub fn new(monitor: M, ctx: MonitorContext, backoff: BackoffPolicy) -> Self {
        let state = MonitorState {
            last_seen: Vec::new(),
            last_seen_version: None,
            consecutive_failures: 0,
            current_interval: backoff.base,
        };
        Self {
            monitor,
            ctx,
            backoff,
            state,
        }
    }

    pub fn monitor(&self) -> &M {
        &self.monitor
    }

    pub fn state(&self) -> &MonitorState<M::Entry> {
        &self.state
    }

    /// Run one full cycle. Never fails: every error is absorbed into the
    /// report and the logs.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let name = self.monitor.name().to_string();
        let client = self.ctx.client.clone();

        let fetched = guard(&name, async {
            self.monitor
                .fetch_data(&client)
                .await
                .map_err(anyhow::Error::new)
        })
        .await;

        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(e) => {
                self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
                self.state.current_interval =
                    self.backoff.interval_for(self.state.consecutive_failures);
                warn!(
                    monitor = %name,
                    failures = self.state.consecutive_failures,
                    interval_secs = self.state.current_interval.as_secs(),
                    "Fetch failed, backing off: {}",
                    e
                );
                return CycleReport {
                    fetch_error: Some(e.to_string()),
                    next_interval: self.state.current_interval,
                    ..CycleReport::default()
                };
            }
        };

        if self.state.consecutive_failures > 0 {
            info!(
                monitor = %name,
                failures = self.state.consecutive_failures,
                "Fetch recovered, interval reset"
            );
        }
        self.state.consecutive_failures = 0;
        self.state.current_interval = self.backoff.base;

        let mut report = CycleReport {
            version: Some(fetched.version),
            next_interval: self.state.current_interval,
            ..CycleReport::default()
        };

        let diff = match guard_sync(&name, || {
            self.monitor
                .process_data(&self.state.last_seen, &fetched.entries)
        }) {
            Ok(diff) => diff,
            Err(e) => {
                error!(monitor = %name, "Diff failed, skipping notifications this cycle: {}", e);
                report.failed_entries += 1;
                EntryDiff::empty()
            }
        };

        report.removed = diff.removed.iter().map(|e| e.key()).collect();
        for entry in &diff.added {
            report.added.push(entry.key());
            self.handle_new_entry(&name, entry, &mut report).await;
        }

        if !diff.added.is_empty() || !diff.removed.is_empty() {
            info!(
                monitor = %name,
                version = fetched.version,
                added = diff.added.len(),
                removed = diff.removed.len(),
                matched = report.matched_owners,
                "Cycle complete"
            );
        } else {
            debug!(monitor = %name, version = fetched.version, "No changes");
        }

        self.state.last_seen = fetched.entries;
        self.state.last_seen_version = Some(fetched.version);
        report
    }

    async fn handle_new_entry(&self, name: &str, entry: &M::Entry, report: &mut CycleReport) {
        let key = entry.key();
        let scope = format!("{}:{}", name, key);

        match guard(&scope, self.monitor.on_new_entry(entry)).await {
            Ok(notifications) => {
                for notification in &notifications {
                    self.deliver(&scope, notification, report).await;
                }
            }
            Err(e) => {
                error!(monitor = %name, entry = %key, "on_new_entry failed: {}", e);
                report.failed_entries += 1;
            }
        }

        let matched = match guard_sync(&scope, || Ok(self.ctx.matcher.match_entry(entry))) {
            Ok(matched) => matched,
            Err(e) => {
                error!(monitor = %name, entry = %key, "Subscription matching failed: {}", e);
                report.failed_entries += 1;
                return;
            }
        };

        for owner in matched {
            report.matched_owners += 1;
            let message = match guard_sync(&scope, || self.monitor.format_match(entry, &owner)) {
                Ok(message) => message,
                Err(e) => {
                    error!(monitor = %name, entry = %key, owner = %owner.owner_id, "Formatting match failed: {}", e);
                    report.failed_entries += 1;
                    continue;
                }
            };
            let notification = Notification::new(
                DeliveryTarget::user(owner.owner_id.clone(), owner.group_id.clone()),
                message,
            );
            self.deliver(&scope, &notification, report).await;
        }
    }

    async fn deliver(&self, scope: &str, notification: &Notification, report: &mut CycleReport) {
        let delivery = self
            .ctx
            .sink
            .deliver(&notification.target, &notification.message);
        match guard(scope, delivery).await {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                warn!(recipient = %notification.target, "Delivery failed: {}", e);
                report.failed_deliveries += 1;
            }
        }
    }
}

enum Slot<M: Monitor> {
    Idle(MonitorRunner<M>),
    Running(JoinHandle<MonitorRunner<M>>),
    /// The loop task died; the runner cannot be recovered.
    Lost,
}

/// Start/stop wrapper running a [`MonitorRunner`] on its own task.
pub struct MonitorEngine<M: Monitor> {
    name: String,
    phase: Arc<RwLock<MonitorPhase>>,
    shutdown: watch::Sender<bool>,
    slot: Mutex<Slot<M>>,
}

impl<M: Monitor> MonitorEngine<M> {
    pub fn new(monitor: M, ctx: MonitorContext, config: &MonitorConfig) -> Self {
        let backoff = BackoffPolicy::new(config.base_interval, config.backoff_cap);
        Self::from_runner(MonitorRunner::new(monitor, ctx, backoff))
    }

    pub fn from_runner(runner: MonitorRunner<M>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name: runner.monitor.name().to_string(),
            phase: Arc::new(RwLock::new(MonitorPhase::Stopped)),
            shutdown,
            slot: Mutex::new(Slot::Idle(runner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> MonitorPhase {
        *self.phase.read()
    }

    /// Begin the periodic loop. No-op when already running.
    pub async fn start(&self) {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Lost) {
            Slot::Idle(runner) => {
                *self.phase.write() = MonitorPhase::Starting;
                self.shutdown.send_replace(false);
                let shutdown = self.shutdown.subscribe();
                let handle = tokio::spawn(run_loop(runner, shutdown));
                *slot = Slot::Running(handle);
                *self.phase.write() = MonitorPhase::Running;
                info!(monitor = %self.name, "Monitor started");
            }
            Slot::Running(handle) => {
                debug!(monitor = %self.name, "Monitor already running");
                *slot = Slot::Running(handle);
            }
            Slot::Lost => {
                error!(monitor = %self.name, "Monitor task was lost, cannot start");
            }
        }
    }

    /// Signal the loop and wait for it to exit. Waits at most for the cycle
    /// in progress; the sleep between cycles is cut short.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        match std::mem::replace(&mut *slot, Slot::Lost) {
            Slot::Running(handle) => {
                *self.phase.write() = MonitorPhase::Stopping;
                self.shutdown.send_replace(true);
                *slot = match handle.await {
                    Ok(runner) => Slot::Idle(runner),
                    Err(e) => {
                        error!(monitor = %self.name, "Monitor task ended abnormally: {}", e);
                        Slot::Lost
                    }
                };
                *self.phase.write() = MonitorPhase::Stopped;
                info!(monitor = %self.name, "Monitor stopped");
            }
            other => *slot = other,
        }
    }

    /// Run a single cycle immediately. Only allowed while stopped; returns
    /// `None` while the loop owns the runner.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        let mut slot = self.slot.lock().await;
        match &mut *slot {
            Slot::Idle(runner) => Some(runner.run_cycle().await),
            _ => None,
        }
    }
}

async fn run_loop<M: Monitor>(
    mut runner: MonitorRunner<M>,
    mut shutdown: watch::Receiver<bool>,
) -> MonitorRunner<M> {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        let report = runner.run_cycle().await;

        tokio::select! {
            _ = tokio::time::sleep(report.next_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    runner
}
