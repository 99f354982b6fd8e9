//! Resource Reconcilers
//!
//! Idempotent create/read/update/delete for pools, volumes and snapshots.
//! Every operation resolves the cluster session through the connection
//! registry, takes the resource's key in that cluster's lock set, compares
//! backend state with the desired state and applies the minimal change.
//!
//! Lock keys:
//! - pool create/delete and volume create: `{cluster}/{pool}`
//! - volume update/delete and every snapshot mutation: the bare volume name
//!
//! Keys of different scope do not exclude each other. A volume create in
//! `ceph1/rbd` and a snapshot create on a volume of that pool may interleave.

pub mod metrics;
pub mod pool;
pub mod snapshot;
pub mod volume;

pub use metrics::{Outcome, ReconcileMetrics};
pub use pool::{PoolSpec, PoolState};
pub use snapshot::{SnapshotChange, SnapshotSpec, SnapshotState};
pub use volume::{VolumeChange, VolumeSpec, VolumeState};

use crate::domain::ports::{ResourceKind, VolumeRef};
use crate::error::Result;
use crate::registry::{ClusterSession, ConnectionRegistry};
use crate::sync::KeyedGuard;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

// =============================================================================
// Observed State
// =============================================================================

/// Outcome of reading a resource. `Gone` is drift, not an error: the caller
/// should forget its recorded identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "state", rename_all = "lowercase")]
pub enum Observed<T> {
    Present(T),
    Gone,
}

impl<T> Observed<T> {
    pub fn is_gone(&self) -> bool {
        matches!(self, Observed::Gone)
    }

    pub fn present(&self) -> Option<&T> {
        match self {
            Observed::Present(state) => Some(state),
            Observed::Gone => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Observed::Present(state) => Some(state),
            Observed::Gone => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Observed<U> {
        match self {
            Observed::Present(state) => Observed::Present(f(state)),
            Observed::Gone => Observed::Gone,
        }
    }
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles pools, volumes and snapshots against live clusters
pub struct Reconciler {
    registry: Arc<ConnectionRegistry>,
    metrics: ReconcileMetrics,
}

impl Reconciler {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: ReconcileMetrics) -> Self {
        Self { registry, metrics }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &ReconcileMetrics {
        &self.metrics
    }

    /// Version string reported by `cluster`
    pub async fn version(&self, cluster: &str) -> Result<String> {
        self.registry.resolve(cluster).await?.client().version().await
    }

    async fn session(&self, cluster: &str) -> Result<Arc<ClusterSession>> {
        self.registry.resolve(cluster).await
    }

    /// Take `key` in the session's lock set, recording the wait
    async fn lock(&self, session: &ClusterSession, kind: ResourceKind, key: &str) -> KeyedGuard {
        let started = Instant::now();
        let guard = session.lock(key).await;
        self.metrics.observe_lock_wait(kind, started.elapsed());
        guard
    }

    /// Record the outcome of an operation and strip it from the result
    fn track<T>(&self, kind: ResourceKind, operation: &str, result: Result<(T, Outcome)>) -> Result<T> {
        match result {
            Ok((value, outcome)) => {
                self.metrics.record(kind, operation, outcome);
                Ok(value)
            }
            Err(e) => {
                self.metrics.record(kind, operation, Outcome::Failed);
                Err(e)
            }
        }
    }
}

/// Close `volume` after its body produced `result`. The body's error wins;
/// otherwise a close failure is surfaced.
async fn close_volume<T>(volume: VolumeRef, result: Result<T>) -> Result<T> {
    let closed = volume.close().await;
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!("failed to close volume '{}': {}", volume.path(), close_err);
            Err(e)
        }
    }
}
