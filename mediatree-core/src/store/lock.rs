//! Per-role scaling lock
//!
//! Serialises autoscaler decisions across controller replicas. The lock is a
//! string key with TTL, taken with SET NX and released by compare-and-delete
//! so a holder can never release a lock someone else re-acquired after expiry.

use std::sync::Arc;
use std::time::Duration;

use super::{keys, StateStore};
use crate::models::{generate_token, NodeKind};
use crate::Result;

/// Proof of lock ownership returned by [`ScalingLock::acquire`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

#[derive(Clone)]
pub struct ScalingLock {
    store: Arc<dyn StateStore>,
}

impl ScalingLock {
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Take `lock:scaling:{kind}` for `ttl`
    ///
    /// Returns `None` if another holder (or a cooldown) owns it.
    pub async fn acquire(&self, kind: NodeKind, ttl: Duration) -> Result<Option<LockGuard>> {
        let key = keys::scaling_lock(kind);
        let token = generate_token();

        if self.store.set_nx_with_ttl(&key, &token, ttl).await? {
            tracing::debug!(lock_key = %key, ttl_ms = ttl.as_millis(), "Lock acquired");
            Ok(Some(LockGuard { key, token }))
        } else {
            tracing::debug!(lock_key = %key, "Lock already held");
            Ok(None)
        }
    }

    /// Keep holding the lock as a cooldown for `ttl` from now
    pub async fn hold_for(&self, guard: &LockGuard, ttl: Duration) -> Result<()> {
        self.store.set_with_ttl(&guard.key, &guard.token, ttl).await?;
        tracing::debug!(lock_key = %guard.key, ttl_ms = ttl.as_millis(), "Lock cooldown set");
        Ok(())
    }

    /// Release the lock if it is still ours
    pub async fn release(&self, guard: &LockGuard) -> Result<bool> {
        let released = self
            .store
            .compare_and_delete(&guard.key, &guard.token)
            .await?;
        if released {
            tracing::debug!(lock_key = %guard.key, "Lock released");
        } else {
            tracing::warn!(
                lock_key = %guard.key,
                "Lock release failed: value mismatch or already expired"
            );
        }
        Ok(released)
    }

    pub async fn is_held(&self, kind: NodeKind) -> Result<bool> {
        self.store.exists(&keys::scaling_lock(kind)).await
    }
}
