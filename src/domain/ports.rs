//! Domain Ports - Backend capability contract
//!
//! The reconcilers depend only on these traits. Adapters implement them
//! against a concrete storage client (the `rbd`/`ceph` tooling, or the
//! in-memory cluster used by the tests).
//!
//! Volume handles are opened for the duration of one operation and must be
//! closed before that operation returns. Snapshot handles borrow the volume
//! they were looked up from and carry no resources of their own.

use crate::domain::path::ResourcePath;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Resource Kinds
// =============================================================================

/// Kinds of resources reconciled against a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pool,
    Volume,
    Snapshot,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pool => "pool",
            ResourceKind::Volume => "volume",
            ResourceKind::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pool" => Ok(ResourceKind::Pool),
            "volume" | "image" => Ok(ResourceKind::Volume),
            "snapshot" | "snap" => Ok(ResourceKind::Snapshot),
            _ => Err(Error::Format {
                input: s.to_string(),
                expected: "pool, volume or snapshot",
            }),
        }
    }
}

// =============================================================================
// Cluster Connector Port
// =============================================================================

/// Establishes sessions to clusters
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Read the cluster's configuration and connect to it
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn StorageCluster>>;
}

// =============================================================================
// Storage Cluster Port
// =============================================================================

/// A live session to one cluster. Safe for concurrent command issuance.
#[async_trait]
pub trait StorageCluster: Send + Sync {
    /// Cluster identifier this session was opened for
    fn cluster(&self) -> &str;

    /// Whether the session can still issue commands
    fn is_connected(&self) -> bool;

    /// Version string reported by the cluster
    async fn version(&self) -> Result<String>;

    /// Check whether a pool exists
    async fn pool_exists(&self, pool: &str) -> Result<bool>;

    /// Create a pool
    async fn create_pool(&self, pool: &str) -> Result<()>;

    /// Delete a pool. May fail with `Error::PermissionDenied`.
    async fn delete_pool(&self, pool: &str) -> Result<()>;

    /// Open a volume by name, `None` if it does not exist
    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeRef>>;

    /// Allocate a new blank volume and open it
    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<VolumeRef>;

    /// Clone `base` (a snapshot-qualified path) into `pool/name` and open it
    async fn clone_volume(&self, base: &ResourcePath, pool: &str, name: &str) -> Result<VolumeRef>;

    /// Remove a volume, returning whether it existed. Absent volumes are not
    /// an error; a volume that is still open or still referenced fails.
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<bool>;

    /// Close the session
    async fn shutdown(&self) -> Result<()>;
}

// =============================================================================
// Volume Port
// =============================================================================

/// An open volume
#[async_trait]
pub trait VolumeHandle: Send + Sync {
    /// Path of the open volume
    fn path(&self) -> &ResourcePath;

    /// Snapshot this volume was cloned from, `None` when independent
    async fn parent(&self) -> Result<Option<ResourcePath>>;

    /// Size in bytes
    async fn size(&self) -> Result<u64>;

    /// Detach from the parent snapshot
    async fn flatten(&self) -> Result<()>;

    async fn lookup_snapshot(&self, name: &str) -> Result<Option<SnapshotRef>>;

    /// Flush pending writes and take a snapshot
    async fn create_snapshot(&self, name: &str) -> Result<SnapshotRef>;

    /// Release the handle
    async fn close(&self) -> Result<()>;
}

// =============================================================================
// Snapshot Port
// =============================================================================

/// A snapshot of an open volume
#[async_trait]
pub trait SnapshotHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn is_protected(&self) -> Result<bool>;

    async fn protect(&self) -> Result<()>;

    async fn unprotect(&self) -> Result<()>;

    /// Revert the owning volume's data to this snapshot
    async fn rollback(&self) -> Result<()>;

    /// Remove the snapshot. Fails while it is protected.
    async fn remove(&self) -> Result<()>;
}

// =============================================================================
// Type Aliases
// =============================================================================

pub type VolumeRef = Box<dyn VolumeHandle>;
pub type SnapshotRef = Box<dyn SnapshotHandle>;
pub type ClusterConnectorRef = Arc<dyn ClusterConnector>;
pub type StorageClusterRef = Arc<dyn StorageCluster>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_kind_display() {
        assert_eq!(format!("{}", ResourceKind::Pool), "pool");
        assert_eq!(format!("{}", ResourceKind::Volume), "volume");
        assert_eq!(format!("{}", ResourceKind::Snapshot), "snapshot");
    }

    #[test]
    fn test_resource_kind_serde() {
        let json = serde_json::to_string(&ResourceKind::Snapshot).unwrap();
        assert_eq!(json, "\"snapshot\"");
    }

    #[test]
    fn test_resource_kind_from_str() {
        assert_eq!("Volume".parse::<ResourceKind>().unwrap(), ResourceKind::Volume);
        assert_eq!("snap".parse::<ResourceKind>().unwrap(), ResourceKind::Snapshot);
        assert!(matches!("bucket".parse::<ResourceKind>(), Err(Error::Format { .. })));
    }
}
