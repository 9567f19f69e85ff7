//! Locally mirrored revocation set.
//!
//! The request hot path only ever reads an in-process `HashSet`; a
//! background task re-fetches the full set from the control store on a
//! short cadence and swaps it in atomically. A just-revoked token may
//! therefore be honored for up to one refresh interval.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;

use crate::errors::GatewayError;
use crate::store::ControlStore;

/// In-process mirror of the revoked-token-id set.
pub struct RevocationCache {
    revoked: RwLock<Arc<HashSet<String>>>,
    /// False after a failed refresh, until the next success.
    healthy: AtomicBool,
    /// When true, an unhealthy cache rejects instead of serving the
    /// last-known set.
    fail_closed: bool,
}

impl RevocationCache {
    pub fn new(fail_closed: bool) -> Arc<Self> {
        Arc::new(Self {
            revoked: RwLock::new(Arc::new(HashSet::new())),
            healthy: AtomicBool::new(true),
            fail_closed,
        })
    }

    /// Hot-path membership check. Never performs I/O.
    pub fn is_revoked(&self, jti: &str) -> Result<bool, GatewayError> {
        if self.fail_closed && !self.healthy.load(Ordering::Relaxed) {
            return Err(GatewayError::auth("revocation data unavailable"));
        }
        let set = match self.revoked.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(_) => return Err(GatewayError::Store("revocation lock poisoned".to_string())),
        };
        Ok(set.contains(jti))
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Swap in a freshly fetched set.
    pub fn apply(&self, set: HashSet<String>) {
        if let Ok(mut guard) = self.revoked.write() {
            *guard = Arc::new(set);
        }
        self.healthy.store(true, Ordering::Relaxed);
    }

    pub fn mark_unhealthy(&self) {
        self.healthy.store(false, Ordering::Relaxed);
    }
}

/// Handle to the background refresh task.
pub struct RevocationRefresher {
    handle: JoinHandle<()>,
}

impl RevocationRefresher {
    /// Stop the refresh task. The cache keeps serving its last snapshot.
    pub fn shutdown(self) {
        self.handle.abort();
    }
}

/// Spawn the periodic refresh task: fetch the full live revoked-id set,
/// swap it into the cache, and opportunistically sweep expired rows.
pub fn spawn_refresher(
    cache: Arc<RevocationCache>,
    store: ControlStore,
    interval: Duration,
) -> RevocationRefresher {
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let now = Utc::now();
            match store.fetch_revoked_ids(now) {
                Ok(set) => {
                    cache.apply(set);
                }
                Err(e) => {
                    tracing::warn!(event = "revocation_refresh_failed", error = %e);
                    cache.mark_unhealthy();
                    continue;
                }
            }
            if let Err(e) = store.sweep_expired_revocations(now) {
                tracing::warn!(event = "revocation_sweep_failed", error = %e);
            }
            if let Err(e) = crate::confirm::sweep_expired(&store, now) {
                tracing::warn!(event = "confirmation_sweep_failed", error = %e);
            }
        }
    });
    RevocationRefresher { handle }
}
