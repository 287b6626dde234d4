//! Error taxonomy for the world-state pipeline.
//!
//! - `UpstreamUnavailable`: transient, absorbed by the monitor loop with backoff
//! - `Subscription(..)`: returned straight to the subscription API caller
//! - `EntryProcessing`: isolated to one entry of one cycle
//! - `Configuration`: fatal at startup only
//!
//! [`guard`] is the single boundary that converts anything a hook can throw
//! (errors and panics alike) into this taxonomy.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use thiserror::Error;
use uuid::Uuid;

use crate::world_state::WorldStateSnapshot;

/// Errors raised by the subscription API. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("owner {owner_id} already has {limit} subscriptions")]
    QuotaExceeded { owner_id: String, limit: usize },

    #[error("owner {owner_id} already has an identical subscription ({existing})")]
    DuplicateCriterion { owner_id: String, existing: Uuid },

    #[error("no matching subscription for owner {owner_id}")]
    NotFound { owner_id: String },

    #[error("subscription must constrain at least one field")]
    EmptyCriterion,
}

#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Upstream fetch failed. `stale` carries the last good snapshot for the
    /// platform, even if its TTL has lapsed.
    #[error("upstream unavailable for {platform}: {reason}")]
    UpstreamUnavailable {
        platform: String,
        reason: String,
        stale: Option<Arc<WorldStateSnapshot>>,
    },

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("failed to process entry in {scope}: {reason}")]
    EntryProcessing { scope: String, reason: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

impl CoreError {
    pub fn upstream(platform: &str, reason: impl ToString) -> Self {
        CoreError::UpstreamUnavailable {
            platform: platform.to_string(),
            reason: reason.to_string(),
            stale: None,
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        CoreError::Configuration(reason.into())
    }

    /// Transient errors are retried by the monitor loop; everything else is not.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::UpstreamUnavailable { .. })
    }

    /// Last good snapshot attached to an upstream failure, if any.
    pub fn stale_snapshot(&self) -> Option<&Arc<WorldStateSnapshot>> {
        match self {
            CoreError::UpstreamUnavailable { stale, .. } => stale.as_ref(),
            _ => None,
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Run one hook invocation behind the error boundary.
///
/// Errors already in the taxonomy pass through, any other `anyhow` error and
/// any panic become `EntryProcessing` tagged with `scope`.
pub async fn guard<F, T>(scope: &str, fut: F) -> CoreResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(classify(scope, err)),
        Err(panic) => Err(CoreError::EntryProcessing {
            scope: scope.to_string(),
            reason: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

/// Blocking counterpart of [`guard`] for synchronous hooks.
pub fn guard_sync<F, T>(scope: &str, f: F) -> CoreResult<T>
where
    F: FnOnce() -> anyhow::Result<T>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(classify(scope, err)),
        Err(panic) => Err(CoreError::EntryProcessing {
            scope: scope.to_string(),
            reason: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

/// Map an arbitrary error into the taxonomy.
pub fn classify(scope: &str, err: anyhow::Error) -> CoreError {
    match err.downcast::<CoreError>() {
        Ok(core) => core,
        Err(err) => match err.downcast::<SubscriptionError>() {
            Ok(sub) => CoreError::Subscription(sub),
            Err(err) => CoreError::EntryProcessing {
                scope: scope.to_string(),
                reason: format!("{:#}", err),
            },
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_value_through() {
        let result = guard("test", async { Ok::<_, anyhow::Error>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_guard_classifies_plain_error() {
        let result: CoreResult<()> =
            guard("fissure", async { Err(anyhow::anyhow!("bad field")) }).await;
        match result {
            Err(CoreError::EntryProcessing { scope, reason }) => {
                assert_eq!(scope, "fissure");
                assert!(reason.contains("bad field"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_guard_catches_panic() {
        let explode = true;
        let result: CoreResult<()> = guard("bounty", async move {
            if explode {
                panic!("formatter exploded");
            }
            Ok(())
        })
        .await;
        match result {
            Err(CoreError::EntryProcessing { reason, .. }) => {
                assert!(reason.contains("formatter exploded"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_guard_sync_catches_panic() {
        let items: Vec<u32> = Vec::new();
        let result: CoreResult<u32> = guard_sync("diff", || Ok(items[3]));
        assert!(matches!(result, Err(CoreError::EntryProcessing { .. })));
        assert_eq!(guard_sync("diff", || Ok::<_, anyhow::Error>(1)).unwrap(), 1);
    }

    #[test]
    fn test_classify_keeps_taxonomy() {
        let err = anyhow::Error::new(CoreError::upstream("pc", "timeout"));
        assert!(classify("x", err).is_transient());

        let err = anyhow::Error::new(SubscriptionError::NotFound {
            owner_id: "42".to_string(),
        });
        assert!(matches!(
            classify("x", err),
            CoreError::Subscription(SubscriptionError::NotFound { .. })
        ));
    }
}
