//! Ceph Reconciler
//!
//! Idempotent, concurrency-safe reconciliation of Ceph pools, RBD volumes
//! and snapshots against live clusters.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                     Manifest apply / destroy (binary)                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │      Pool       │  │     Volume      │  │         Snapshot            │  │
//! │  │   Reconciler    │  │   Reconciler    │  │        Reconciler           │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                                │                                             │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Connection Registry  │                                │
//! │                    │ (1 session / cluster, │                                │
//! │                    │  keyed locks each)    │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                       Cluster Ports (domain)                                 │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │     rbd / ceph CLI          │  │           In-memory                 │   │
//! │  │   (tokio::process)          │  │   (tests, dry runs)                 │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`reconciler`]: Pool, volume and snapshot reconciliation
//! - [`registry`]: Per-cluster connection cache
//! - [`sync`]: Keyed locks and the wait-for-success helper
//! - [`backends`]: Cluster adapters
//! - [`domain`]: Resource identifiers and backend ports
//! - [`manifest`]: Declarative apply/destroy of resource lists
//! - [`config`]: Configuration file handling
//! - [`error`]: Error types and handling

pub mod backends;
pub mod config;
pub mod domain;
pub mod error;
pub mod manifest;
pub mod reconciler;
pub mod registry;
pub mod sync;

// Re-export commonly used types
pub use backends::{BackendFactory, BackendKind, MemoryConnector, RbdCliConfig, RbdCliConnector};

pub use config::{Config, WaitConfig};

pub use domain::path::{PoolId, ResourcePath};
pub use domain::ports::{
    ClusterConnector, ResourceKind, SnapshotHandle, StorageCluster, VolumeHandle,
};

pub use error::{Error, ErrorAction, Result};

pub use manifest::{Manifest, Report, Resource};

pub use reconciler::{
    Observed, PoolSpec, PoolState, ReconcileMetrics, Reconciler, SnapshotChange, SnapshotSpec,
    SnapshotState, VolumeChange, VolumeSpec, VolumeState,
};

pub use registry::{ClusterSession, ConnectionEvent, ConnectionRegistry};

pub use sync::{wait_for_success, KeyedGuard, KeyedLocks, WaitPolicy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
