//! Durable storage for subscription criteria.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::SubscriptionCriterion;

pub trait SubscriptionStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<SubscriptionCriterion>>;
    fn save_all(&self, criteria: &[SubscriptionCriterion]) -> Result<()>;
}

/// Pretty-printed JSON array on disk. Writes go to a sibling temp file that
/// is renamed over the target, so readers never see a partial file.
#[derive(Debug, Clone)]
pub struct JsonFileSubscriptionStore {
    path: PathBuf,
}

impl JsonFileSubscriptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "subscriptions.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl SubscriptionStore for JsonFileSubscriptionStore {
    fn load_all(&self) -> Result<Vec<SubscriptionCriterion>> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No subscription file yet");
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            warn!(path = %self.path.display(), "Subscription file is empty");
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn save_all(&self, criteria: &[SubscriptionCriterion]) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(criteria)?;
        let temp = self.temp_path();
        fs::write(&temp, json).with_context(|| format!("Failed to write {}", temp.display()))?;
        fs::rename(&temp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = criteria.len(), "Subscriptions saved");
        Ok(())
    }
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    criteria: Mutex<Vec<SubscriptionCriterion>>,
    fail_saves: AtomicBool,
    saves: AtomicUsize,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_criteria(criteria: Vec<SubscriptionCriterion>) -> Self {
        Self {
            criteria: Mutex::new(criteria),
            ..Self::default()
        }
    }

    /// Make every following `save_all` fail.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn saved(&self) -> Vec<SubscriptionCriterion> {
        self.criteria.lock().clone()
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    fn load_all(&self) -> Result<Vec<SubscriptionCriterion>> {
        Ok(self.criteria.lock().clone())
    }

    fn save_all(&self, criteria: &[SubscriptionCriterion]) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(anyhow!("store unavailable"));
        }
        *self.criteria.lock() = criteria.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
