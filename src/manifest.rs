//! Declarative Manifests
//!
//! A YAML document listing resources in dependency order:
//!
//! ```yaml
//! resources:
//!   - kind: pool
//!     cluster: ceph1
//!     name: rbd
//!   - kind: volume
//!     pool_id: ceph1/rbd
//!     name: vol1
//!     size: 1073741824
//!   - kind: snapshot
//!     base_volume: ceph1/rbd/vol1
//!     name: s1
//!     protect: true
//! ```
//!
//! `apply` reconciles resources in order and `destroy` deletes them in
//! reverse order. Both stop at the first failure.

use crate::domain::path::{PoolId, ResourcePath};
use crate::domain::ports::ResourceKind;
use crate::error::{Error, Result};
use crate::reconciler::{Observed, PoolSpec, Reconciler, SnapshotSpec, VolumeSpec};
use crate::sync::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};

// =============================================================================
// Manifest
// =============================================================================

/// One desired resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Resource {
    Pool(PoolSpec),
    Volume(VolumeSpec),
    Snapshot(SnapshotSpec),
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Pool(_) => ResourceKind::Pool,
            Resource::Volume(_) => ResourceKind::Volume,
            Resource::Snapshot(_) => ResourceKind::Snapshot,
        }
    }

    /// Identifier the resource will have once created
    pub fn id(&self) -> Result<String> {
        match self {
            Resource::Pool(spec) => spec.id().map(|id| id.to_string()),
            Resource::Volume(spec) => spec.id().map(|id| id.to_string()),
            Resource::Snapshot(spec) => spec.id().map(|id| id.to_string()),
        }
    }
}

/// Ordered list of desired resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub resources: Vec<Resource>,
}

impl Manifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(text)?;
        for resource in &manifest.resources {
            resource.id()?;
        }
        Ok(manifest)
    }
}

// =============================================================================
// Reports
// =============================================================================

/// A resource an operation completed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: String,
}

/// The resource an operation stopped at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: ResourceKind,
    pub id: Option<String>,
    pub error: String,
}

/// Result of applying or destroying a manifest
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub completed: Vec<ResourceRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<Failure>,
}

impl Report {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    fn complete(&mut self, kind: ResourceKind, id: String) {
        self.completed.push(ResourceRef { kind, id });
    }

    fn fail(&mut self, kind: ResourceKind, id: Option<String>, err: &Error) {
        error!("{} '{}' failed: {}", kind, id.as_deref().unwrap_or("-"), err);
        self.failed = Some(Failure {
            kind,
            id,
            error: err.to_string(),
        });
    }
}

// =============================================================================
// Apply / Destroy
// =============================================================================

async fn apply_one(reconciler: &Reconciler, resource: &Resource) -> Result<String> {
    match resource {
        Resource::Pool(spec) => Ok(reconciler.create_pool(spec).await?.to_string()),
        Resource::Volume(spec) => Ok(reconciler.create_volume(spec).await?.id.to_string()),
        Resource::Snapshot(spec) => Ok(reconciler.create_snapshot(spec).await?.id.to_string()),
    }
}

/// Reconcile every resource in order, stopping at the first failure. A
/// resource that was created but not fully reconciled is still reported as
/// completed so its identifier is not lost.
pub async fn apply(reconciler: &Reconciler, manifest: &Manifest) -> Report {
    let mut report = Report::default();

    for resource in &manifest.resources {
        let kind = resource.kind();
        match apply_one(reconciler, resource).await {
            Ok(id) => {
                info!("applied {} '{}'", kind, id);
                report.complete(kind, id);
            }
            Err(e) => {
                if let Some(id) = e.recorded_id() {
                    report.complete(kind, id.to_string());
                }
                report.fail(kind, resource.id().ok(), &e);
                break;
            }
        }
    }
    report
}

/// Delete every resource in reverse order, stopping at the first failure
pub async fn destroy(reconciler: &Reconciler, manifest: &Manifest, wait: Option<&WaitPolicy>) -> Report {
    let mut report = Report::default();

    for resource in manifest.resources.iter().rev() {
        let kind = resource.kind();
        let id = match resource.id() {
            Ok(id) => id,
            Err(e) => {
                report.fail(kind, None, &e);
                break;
            }
        };

        match delete_resource(reconciler, kind, &id, wait).await {
            Ok(()) => {
                info!("destroyed {} '{}'", kind, id);
                report.complete(kind, id);
            }
            Err(e) => {
                report.fail(kind, Some(id), &e);
                break;
            }
        }
    }
    report
}

// =============================================================================
// Single-resource Dispatch
// =============================================================================

/// Read one resource by kind and identifier
pub async fn read_resource(reconciler: &Reconciler, kind: ResourceKind, id: &str) -> Result<Observed<serde_json::Value>> {
    let id = id.trim();
    let observed = match kind {
        ResourceKind::Pool => to_json(reconciler.read_pool(&id.parse::<PoolId>()?).await?)?,
        ResourceKind::Volume => to_json(reconciler.read_volume(&ResourcePath::parse_volume(id)?).await?)?,
        ResourceKind::Snapshot => {
            to_json(reconciler.read_snapshot(&ResourcePath::parse_snapshot(id)?).await?)?
        }
    };
    Ok(observed)
}

/// Delete one resource by kind and identifier. `wait` applies to volumes.
pub async fn delete_resource(
    reconciler: &Reconciler,
    kind: ResourceKind,
    id: &str,
    wait: Option<&WaitPolicy>,
) -> Result<()> {
    let id = id.trim();
    match kind {
        ResourceKind::Pool => reconciler.delete_pool(&id.parse::<PoolId>()?).await,
        ResourceKind::Volume => {
            reconciler
                .delete_volume(&ResourcePath::parse_volume(id)?, wait)
                .await
        }
        ResourceKind::Snapshot => {
            reconciler
                .delete_snapshot(&ResourcePath::parse_snapshot(id)?)
                .await
        }
    }
}

fn to_json<T: Serialize>(observed: Observed<T>) -> Result<Observed<serde_json::Value>> {
    match observed {
        Observed::Present(state) => Ok(Observed::Present(serde_json::to_value(state)?)),
        Observed::Gone => Ok(Observed::Gone),
    }
}
