//! Snapshot reconciliation
//!
//! Protection of a pre-existing snapshot is never changed as a side effect of
//! create; only an explicit update or delete touches it.

use super::{close_volume, Observed, Outcome, Reconciler};
use crate::domain::path::ResourcePath;
use crate::domain::ports::{ResourceKind, SnapshotHandle, VolumeHandle};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Desired snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSpec {
    /// `{cluster}/{pool}/{volume}` the snapshot is taken from
    pub base_volume: ResourcePath,
    pub name: String,
    #[serde(default)]
    pub protect: bool,
    /// Rolls the volume back to this snapshot when the value changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_datetime: Option<String>,
}

/// Observed snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotState {
    pub id: ResourcePath,
    pub base_volume: ResourcePath,
    pub name: String,
    pub protected: bool,
}

/// Explicit update commands for an existing snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotChange {
    SetProtect(bool),
    /// Revert the owning volume to this snapshot; the value is an opaque trigger
    Rollback(String),
}

impl SnapshotSpec {
    pub fn new(base_volume: ResourcePath, name: impl Into<String>, protect: bool) -> Self {
        Self {
            base_volume,
            name: name.into(),
            protect,
            rollback_datetime: None,
        }
    }

    pub fn id(&self) -> Result<ResourcePath> {
        if self.base_volume.is_snapshot() {
            return Err(Error::Format {
                input: self.base_volume.to_string(),
                expected: "{cluster}/{pool}/{volume}",
            });
        }
        self.base_volume.with_snapshot(self.name.trim())
    }

    fn rollback(&self) -> Option<&str> {
        self.rollback_datetime
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Commands that move a snapshot from `prior` to this spec
    pub fn changes_from(&self, prior: &SnapshotSpec) -> Vec<SnapshotChange> {
        let mut changes = Vec::new();
        if self.protect != prior.protect {
            changes.push(SnapshotChange::SetProtect(self.protect));
        }
        if self.rollback() != prior.rollback() {
            if let Some(trigger) = self.rollback() {
                changes.push(SnapshotChange::Rollback(trigger.to_string()));
            }
        }
        changes
    }
}

fn require_snapshot_path(id: &ResourcePath) -> Result<()> {
    if !id.is_snapshot() {
        return Err(Error::Format {
            input: id.to_string(),
            expected: "{cluster}/{pool}/{volume}@{snapshot}",
        });
    }
    Ok(())
}

fn snapshot_state(id: &ResourcePath, protected: bool) -> SnapshotState {
    SnapshotState {
        id: id.clone(),
        base_volume: id.volume_path(),
        name: id.snapshot_name().unwrap_or_default().to_string(),
        protected,
    }
}

async fn observe_snapshot(volume: &dyn VolumeHandle, id: &ResourcePath) -> Result<Observed<SnapshotState>> {
    let name = id.snapshot_name().unwrap_or_default();
    match volume.lookup_snapshot(name).await? {
        Some(snapshot) => {
            let protected = snapshot.is_protected().await?;
            Ok(Observed::Present(snapshot_state(id, protected)))
        }
        None => {
            warn!("snapshot '{}' may have been deleted out of band", id);
            Ok(Observed::Gone)
        }
    }
}

/// Protect or unprotect only when the current state differs
async fn set_protection(snapshot: &dyn SnapshotHandle, id: &ResourcePath, protect: bool) -> Result<bool> {
    if snapshot.is_protected().await? == protect {
        return Ok(false);
    }
    if protect {
        info!("protect snapshot '{}'", id);
        snapshot.protect().await?;
    } else {
        info!("unprotect snapshot '{}'", id);
        snapshot.unprotect().await?;
    }
    Ok(true)
}

async fn ensure_snapshot(volume: &dyn VolumeHandle, id: &ResourcePath, protect: bool) -> Result<(SnapshotState, Outcome)> {
    let name = id.snapshot_name().unwrap_or_default();

    if let Some(snapshot) = volume.lookup_snapshot(name).await? {
        let protected = snapshot.is_protected().await?;
        if protected != protect {
            return Err(Error::validation(
                id.to_string(),
                "snapshot already exists, but protect attribute mismatch",
            ));
        }
        info!("snapshot '{}' already exists", id);
        return Ok((snapshot_state(id, protected), Outcome::Unchanged));
    }

    info!("create snapshot '{}'", id);
    let snapshot = volume.create_snapshot(name).await?;
    set_protection(snapshot.as_ref(), id, protect)
        .await
        .map_err(|e| Error::incomplete(id.to_string(), e))?;
    Ok((snapshot_state(id, protect), Outcome::Changed))
}

async fn apply_changes(volume: &dyn VolumeHandle, id: &ResourcePath, changes: &[SnapshotChange]) -> Result<bool> {
    let name = id.snapshot_name().unwrap_or_default();
    let snapshot = volume
        .lookup_snapshot(name)
        .await?
        .ok_or_else(|| Error::not_found("snapshot", id.to_string()))?;

    let mut changed = false;
    for change in changes {
        match change {
            SnapshotChange::SetProtect(protect) => {
                changed |= set_protection(snapshot.as_ref(), id, *protect).await?;
            }
            SnapshotChange::Rollback(trigger) if trigger.trim().is_empty() => {}
            SnapshotChange::Rollback(_) => {
                info!("rollback to snapshot '{}'", id);
                snapshot.rollback().await?;
                changed = true;
            }
        }
    }
    Ok(changed)
}

/// Remove the snapshot, clearing protection first. Returns whether anything
/// was removed.
async fn remove_snapshot(volume: &dyn VolumeHandle, id: &ResourcePath) -> Result<bool> {
    let name = id.snapshot_name().unwrap_or_default();
    let Some(snapshot) = volume.lookup_snapshot(name).await? else {
        debug!("snapshot '{}' already absent", id);
        return Ok(false);
    };

    if snapshot.is_protected().await? {
        warn!("snapshot '{}' is protected, unprotecting before removal", id);
        snapshot.unprotect().await?;
    }
    snapshot.remove().await?;
    info!("deleted snapshot '{}'", id);
    Ok(true)
}

impl Reconciler {
    /// Ensure the snapshot exists with the requested protection
    pub async fn create_snapshot(&self, spec: &SnapshotSpec) -> Result<SnapshotState> {
        let result = self.create_snapshot_inner(spec).await;
        self.track(ResourceKind::Snapshot, "create", result)
    }

    async fn create_snapshot_inner(&self, spec: &SnapshotSpec) -> Result<(SnapshotState, Outcome)> {
        let id = spec.id()?;
        debug!("create snapshot '{}'", id);
        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Snapshot, id.name()).await;

        let volume = session
            .client()
            .lookup_volume(id.pool(), id.name())
            .await?
            .ok_or_else(|| Error::not_found("volume", spec.base_volume.to_string()))?;

        let result = ensure_snapshot(volume.as_ref(), &id, spec.protect).await;
        let created = matches!(result, Ok((_, Outcome::Changed)));
        close_volume(volume, result).await.map_err(|e| {
            if created {
                Error::incomplete(id.to_string(), e)
            } else {
                e
            }
        })
    }

    /// Report protection state, or `Gone` if the volume or snapshot disappeared
    pub async fn read_snapshot(&self, id: &ResourcePath) -> Result<Observed<SnapshotState>> {
        let result = self.read_snapshot_inner(id).await;
        self.track(ResourceKind::Snapshot, "read", result)
    }

    async fn read_snapshot_inner(&self, id: &ResourcePath) -> Result<(Observed<SnapshotState>, Outcome)> {
        require_snapshot_path(id)?;
        debug!("read snapshot '{}'", id);
        let session = self.session(id.cluster()).await?;

        let Some(volume) = session.client().lookup_volume(id.pool(), id.name()).await? else {
            warn!("volume of snapshot '{}' may have been deleted out of band", id);
            return Ok((Observed::Gone, Outcome::Gone));
        };

        let result = observe_snapshot(volume.as_ref(), id).await;

        let observed = close_volume(volume, result).await?;
        let outcome = if observed.is_gone() { Outcome::Gone } else { Outcome::Unchanged };
        Ok((observed, outcome))
    }

    /// Apply update commands to an existing snapshot
    pub async fn update_snapshot(&self, id: &ResourcePath, changes: &[SnapshotChange]) -> Result<()> {
        let result = self.update_snapshot_inner(id, changes).await;
        self.track(ResourceKind::Snapshot, "update", result)
    }

    async fn update_snapshot_inner(&self, id: &ResourcePath, changes: &[SnapshotChange]) -> Result<((), Outcome)> {
        require_snapshot_path(id)?;
        if changes.is_empty() {
            return Ok(((), Outcome::Unchanged));
        }
        debug!("update snapshot '{}': {:?}", id, changes);

        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Snapshot, id.name()).await;

        let volume = session
            .client()
            .lookup_volume(id.pool(), id.name())
            .await?
            .ok_or_else(|| Error::not_found("volume", id.volume_path().to_string()))?;

        let result = apply_changes(volume.as_ref(), id, changes).await;
        let changed = close_volume(volume, result).await?;
        Ok(((), if changed { Outcome::Changed } else { Outcome::Unchanged }))
    }

    /// Delete the snapshot, unprotecting it first if needed. A missing
    /// volume or snapshot is success.
    pub async fn delete_snapshot(&self, id: &ResourcePath) -> Result<()> {
        let result = self.delete_snapshot_inner(id).await;
        self.track(ResourceKind::Snapshot, "delete", result)
    }

    async fn delete_snapshot_inner(&self, id: &ResourcePath) -> Result<((), Outcome)> {
        require_snapshot_path(id)?;
        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Snapshot, id.name()).await;

        let Some(volume) = session.client().lookup_volume(id.pool(), id.name()).await? else {
            debug!("volume of snapshot '{}' already absent", id);
            return Ok(((), Outcome::Unchanged));
        };

        let result = remove_snapshot(volume.as_ref(), id).await;
        let removed = close_volume(volume, result).await?;
        Ok(((), if removed { Outcome::Changed } else { Outcome::Unchanged }))
    }
}
