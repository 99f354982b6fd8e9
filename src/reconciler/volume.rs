//! Volume reconciliation
//!
//! A volume is either allocated with an explicit size or cloned from a
//! snapshot. A clone reports its base snapshot as parent until flattened.
//! Parentage cannot be changed after creation except by detaching it.

use super::{close_volume, Observed, Outcome, Reconciler};
use crate::domain::path::{PoolId, ResourcePath};
use crate::domain::ports::{ResourceKind, VolumeHandle};
use crate::error::{Error, Result};
use crate::sync::{wait_for_success, WaitPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// =============================================================================
// Desired and Observed State
// =============================================================================

/// Desired volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub pool_id: PoolId,
    pub name: String,
    /// Size in bytes, exclusive with `base_snapshot`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// `{cluster}/{pool}/{volume}@{snapshot}` to clone from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_snapshot: Option<String>,
    /// Rolls the volume back to this snapshot when the value changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_snapshot_name: Option<String>,
}

/// Observed volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeState {
    pub id: ResourcePath,
    pub pool_id: PoolId,
    pub name: String,
    pub size: u64,
    pub parent: Option<ResourcePath>,
}

/// Explicit update commands for an existing volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeChange {
    /// Flatten the volume if it still has a parent
    DetachBase,
    /// Always rejected: parentage is fixed at creation
    SetBase(String),
    /// Revert the volume's data to the named snapshot
    Rollback(String),
}

/// How a missing volume gets created
#[derive(Debug, Clone, PartialEq, Eq)]
enum VolumeSource {
    Allocate(u64),
    Clone(ResourcePath),
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl VolumeSpec {
    /// Volume allocated with `size` bytes
    pub fn sized(pool_id: PoolId, name: impl Into<String>, size: u64) -> Self {
        Self {
            pool_id,
            name: name.into(),
            size: Some(size),
            base_snapshot: None,
            rollback_snapshot_name: None,
        }
    }

    /// Volume cloned from `base_snapshot`
    pub fn cloned(pool_id: PoolId, name: impl Into<String>, base_snapshot: impl Into<String>) -> Self {
        Self {
            pool_id,
            name: name.into(),
            size: None,
            base_snapshot: Some(base_snapshot.into()),
            rollback_snapshot_name: None,
        }
    }

    pub fn id(&self) -> Result<ResourcePath> {
        self.pool_id.volume(self.name.trim())
    }

    fn base(&self) -> Option<&str> {
        non_blank(self.base_snapshot.as_deref())
    }

    fn rollback(&self) -> Option<&str> {
        non_blank(self.rollback_snapshot_name.as_deref())
    }

    /// Validate the inputs without touching the backend
    fn source(&self, id: &ResourcePath) -> Result<VolumeSource> {
        let size = self.size.filter(|s| *s > 0);
        match (size, self.base()) {
            (Some(_), Some(_)) => Err(Error::validation(
                id.to_string(),
                "size and base_snapshot are mutually exclusive",
            )),
            (None, None) => Err(Error::validation(
                id.to_string(),
                "size must be specified when base snapshot is missing",
            )),
            (Some(size), None) => Ok(VolumeSource::Allocate(size)),
            (None, Some(base)) => {
                let base: ResourcePath = base.parse().map_err(|e| {
                    Error::validation(id.to_string(), format!("invalid base snapshot: {}", e))
                })?;
                if base.cluster() != id.cluster() {
                    return Err(Error::validation(
                        id.to_string(),
                        format!(
                            "invalid base snapshot from different cluster: {} | {}",
                            base.cluster(),
                            id.cluster()
                        ),
                    ));
                }
                if !base.is_snapshot() {
                    return Err(Error::validation(
                        id.to_string(),
                        format!("invalid base snapshot without snapshot name: {}", base),
                    ));
                }
                Ok(VolumeSource::Clone(base))
            }
        }
    }

    /// Commands that move a volume from `prior` to this spec. Rollback fires
    /// only when the trigger value changed to something non-empty.
    pub fn changes_from(&self, prior: &VolumeSpec) -> Vec<VolumeChange> {
        let mut changes = Vec::new();
        if self.base() != prior.base() {
            changes.push(match self.base() {
                Some(base) => VolumeChange::SetBase(base.to_string()),
                None => VolumeChange::DetachBase,
            });
        }
        if self.rollback() != prior.rollback() {
            if let Some(name) = self.rollback() {
                changes.push(VolumeChange::Rollback(name.to_string()));
            }
        }
        changes
    }
}

fn require_volume_path(id: &ResourcePath) -> Result<()> {
    if id.is_snapshot() {
        return Err(Error::Format {
            input: id.to_string(),
            expected: "{cluster}/{pool}/{volume}",
        });
    }
    Ok(())
}

fn describe(parent: Option<&ResourcePath>) -> String {
    parent.map_or_else(|| "no parent".to_string(), ToString::to_string)
}

async fn observe(volume: &dyn VolumeHandle) -> Result<VolumeState> {
    let path = volume.path();
    Ok(VolumeState {
        id: path.clone(),
        pool_id: path.pool_id(),
        name: path.name().to_string(),
        size: volume.size().await?,
        parent: volume.parent().await?,
    })
}

/// Check a pre-existing volume against the requested source
async fn verify_existing(volume: &dyn VolumeHandle, source: &VolumeSource) -> Result<VolumeState> {
    let state = observe(volume).await?;
    let id = state.id.to_string();

    let expected_parent = match source {
        VolumeSource::Clone(base) => Some(base),
        VolumeSource::Allocate(_) => None,
    };
    if state.parent.as_ref() != expected_parent {
        return Err(Error::validation(
            id,
            format!(
                "base_snapshot mismatch: volume has {}, requested {}",
                describe(state.parent.as_ref()),
                describe(expected_parent)
            ),
        ));
    }

    if let VolumeSource::Allocate(requested) = source {
        if *requested != state.size {
            return Err(Error::validation(
                id,
                format!(
                    "volume already exists, but size mismatch: {} != {}",
                    state.size, requested
                ),
            ));
        }
    }
    Ok(state)
}

async fn apply_changes(volume: &dyn VolumeHandle, changes: &[VolumeChange]) -> Result<bool> {
    let id = volume.path().to_string();
    let mut changed = false;

    for change in changes {
        match change {
            VolumeChange::SetBase(_) => {
                return Err(Error::validation(id, "base_snapshot can't be set for existing volume"));
            }
            VolumeChange::DetachBase => match volume.parent().await? {
                Some(parent) => {
                    info!("flatten volume '{}' from '{}'", id, parent);
                    volume.flatten().await?;
                    changed = true;
                }
                None => debug!("volume '{}' has no parent, nothing to flatten", id),
            },
            VolumeChange::Rollback(name) => {
                let Some(name) = non_blank(Some(name.as_str())) else {
                    continue;
                };
                let snapshot = volume
                    .lookup_snapshot(name)
                    .await?
                    .ok_or_else(|| Error::not_found("snapshot", format!("{}@{}", id, name)))?;

                info!("rollback volume '{}' to snapshot '{}'", id, name);
                snapshot.rollback().await?;
                changed = true;
            }
        }
    }
    Ok(changed)
}

// =============================================================================
// Operations
// =============================================================================

impl Reconciler {
    /// Ensure the volume exists with the requested size or base snapshot
    pub async fn create_volume(&self, spec: &VolumeSpec) -> Result<VolumeState> {
        let result = self.create_volume_inner(spec).await;
        self.track(ResourceKind::Volume, "create", result)
    }

    async fn create_volume_inner(&self, spec: &VolumeSpec) -> Result<(VolumeState, Outcome)> {
        let id = spec.id()?;
        let source = spec.source(&id)?;
        debug!("create volume '{}'", id);

        let session = self.session(id.cluster()).await?;
        let _guard = self
            .lock(&session, ResourceKind::Volume, &id.pool_id().to_string())
            .await;
        let client = session.client();

        if let Some(volume) = client.lookup_volume(id.pool(), id.name()).await? {
            let result = verify_existing(volume.as_ref(), &source).await;
            let state = close_volume(volume, result).await?;
            info!("volume '{}' already exists", id);
            return Ok((state, Outcome::Unchanged));
        }

        let volume = match &source {
            VolumeSource::Allocate(size) => {
                info!("create volume '{}' with {} bytes", id, size);
                client.create_volume(id.pool(), id.name(), *size).await?
            }
            VolumeSource::Clone(base) => {
                info!("clone volume '{}' from '{}'", id, base);
                client.clone_volume(base, id.pool(), id.name()).await?
            }
        };

        let result = observe(volume.as_ref()).await;
        let state = close_volume(volume, result)
            .await
            .map_err(|e| Error::incomplete(id.to_string(), e))?;
        Ok((state, Outcome::Changed))
    }

    /// Report current size and parent, or `Gone` if the volume disappeared
    pub async fn read_volume(&self, id: &ResourcePath) -> Result<Observed<VolumeState>> {
        let result = self.read_volume_inner(id).await;
        self.track(ResourceKind::Volume, "read", result)
    }

    async fn read_volume_inner(&self, id: &ResourcePath) -> Result<(Observed<VolumeState>, Outcome)> {
        require_volume_path(id)?;
        debug!("read volume '{}'", id);
        let session = self.session(id.cluster()).await?;

        let Some(volume) = session.client().lookup_volume(id.pool(), id.name()).await? else {
            warn!("volume '{}' may have been deleted out of band", id);
            return Ok((Observed::Gone, Outcome::Gone));
        };

        let result = observe(volume.as_ref()).await;
        let state = close_volume(volume, result).await?;
        Ok((Observed::Present(state), Outcome::Unchanged))
    }

    /// Apply update commands to an existing volume
    pub async fn update_volume(&self, id: &ResourcePath, changes: &[VolumeChange]) -> Result<()> {
        let result = self.update_volume_inner(id, changes).await;
        self.track(ResourceKind::Volume, "update", result)
    }

    async fn update_volume_inner(&self, id: &ResourcePath, changes: &[VolumeChange]) -> Result<((), Outcome)> {
        require_volume_path(id)?;
        if changes.iter().any(|c| matches!(c, VolumeChange::SetBase(_))) {
            return Err(Error::validation(
                id.to_string(),
                "base_snapshot can't be set for existing volume",
            ));
        }
        if changes.is_empty() {
            return Ok(((), Outcome::Unchanged));
        }
        debug!("update volume '{}': {:?}", id, changes);

        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Volume, id.name()).await;

        let volume = session
            .client()
            .lookup_volume(id.pool(), id.name())
            .await?
            .ok_or_else(|| Error::not_found("volume", id.to_string()))?;

        let result = apply_changes(volume.as_ref(), changes).await;
        let changed = close_volume(volume, result).await?;
        Ok(((), if changed { Outcome::Changed } else { Outcome::Unchanged }))
    }

    /// Delete the volume. An absent volume is success. With `wait`, a
    /// refusal (e.g. the image is still open elsewhere) is retried until the
    /// policy's timeout.
    pub async fn delete_volume(&self, id: &ResourcePath, wait: Option<&WaitPolicy>) -> Result<()> {
        let result = self.delete_volume_inner(id, wait).await;
        self.track(ResourceKind::Volume, "delete", result)
    }

    async fn delete_volume_inner(&self, id: &ResourcePath, wait: Option<&WaitPolicy>) -> Result<((), Outcome)> {
        require_volume_path(id)?;
        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Volume, id.name()).await;
        let client = session.client();

        debug!("delete volume '{}'", id);
        let removed = match wait {
            Some(policy) => {
                let message = format!("delete volume '{}'", id);
                wait_for_success(&message, policy, || client.delete_volume(id.pool(), id.name())).await?
            }
            None => client.delete_volume(id.pool(), id.name()).await?,
        };

        if removed {
            info!("deleted volume '{}'", id);
            Ok(((), Outcome::Changed))
        } else {
            debug!("volume '{}' already absent", id);
            Ok(((), Outcome::Unchanged))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::ClusterConnector;
    use crate::reconciler::testing;
    use crate::reconciler::SnapshotSpec;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool() -> PoolId {
        "ceph1/rbd".parse().unwrap()
    }

    fn path(s: &str) -> ResourcePath {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_clone_delete_flatten_scenario() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");

        let vol1 = reconciler.create_volume(&VolumeSpec::sized(pool(), "vol1", 1024)).await.unwrap();
        assert_eq!(vol1.id.to_string(), "ceph1/rbd/vol1");
        assert_eq!(vol1.size, 1024);
        assert_eq!(vol1.parent, None);

        reconciler
            .create_snapshot(&SnapshotSpec::new(vol1.id.clone(), "s1", false))
            .await
            .unwrap();

        let vol2 = reconciler
            .create_volume(&VolumeSpec::cloned(pool(), "vol2", "ceph1/rbd/vol1@s1"))
            .await
            .unwrap();
        assert_eq!(vol2.parent.as_ref().map(ToString::to_string).as_deref(), Some("ceph1/rbd/vol1@s1"));
        assert_eq!(vol2.size, 1024);

        let err = reconciler.delete_volume(&vol1.id, None).await.unwrap_err();
        assert_matches!(err, Error::Backend { ref reason, .. } if reason.contains("parent still referenced"));
        assert!(state.has_volume("rbd", "vol1"));

        reconciler.update_volume(&vol2.id, &[VolumeChange::DetachBase]).await.unwrap();
        let observed = reconciler.read_volume(&vol2.id).await.unwrap().into_option().unwrap();
        assert_eq!(observed.parent, None);
        assert_eq!(observed.size, 1024);

        assert_eq!(state.total_open_handles(), 0);
    }

    #[tokio::test]
    async fn test_inputs_validated_before_backend() {
        let (reconciler, connector, state) = testing::reconciler("ceph1");

        let mut both = VolumeSpec::sized(pool(), "vol1", 1024);
        both.base_snapshot = Some("ceph1/rbd/base@s1".into());
        assert_matches!(
            reconciler.create_volume(&both).await,
            Err(Error::Validation { ref reason, .. }) if reason.contains("mutually exclusive")
        );

        let neither = VolumeSpec::sized(pool(), "vol1", 0);
        assert_matches!(
            reconciler.create_volume(&neither).await,
            Err(Error::Validation { ref reason, .. }) if reason == "size must be specified when base snapshot is missing"
        );

        let other_cluster = VolumeSpec::cloned(pool(), "vol1", "ceph2/rbd/base@s1");
        assert_matches!(
            reconciler.create_volume(&other_cluster).await,
            Err(Error::Validation { ref reason, .. }) if reason.contains("different cluster")
        );

        let no_snapshot = VolumeSpec::cloned(pool(), "vol1", "ceph1/rbd/base");
        assert_matches!(
            reconciler.create_volume(&no_snapshot).await,
            Err(Error::Validation { ref reason, .. }) if reason.contains("without snapshot name")
        );

        assert_eq!(connector.connect_count("ceph1"), 0);
        assert!(state.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_existing_volume_verified_without_mutation() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");
        let spec = VolumeSpec::sized(pool(), "vol1", 1024);
        reconciler.create_volume(&spec).await.unwrap();
        state.clear_mutations();

        let again = reconciler.create_volume(&spec).await.unwrap();
        assert_eq!(again.size, 1024);

        assert_matches!(
            reconciler.create_volume(&VolumeSpec::sized(pool(), "vol1", 2048)).await,
            Err(Error::Validation { ref reason, .. }) if reason.contains("size mismatch")
        );
        assert_matches!(
            reconciler
                .create_volume(&VolumeSpec::cloned(pool(), "vol1", "ceph1/rbd/other@s1"))
                .await,
            Err(Error::Validation { ref reason, .. }) if reason.contains("base_snapshot mismatch")
        );

        assert!(state.mutations().is_empty());
        assert_eq!(state.total_open_handles(), 0);
    }

    #[tokio::test]
    async fn test_clone_from_missing_snapshot_fails_cleanly() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");

        let result = reconciler
            .create_volume(&VolumeSpec::cloned(pool(), "vol2", "ceph1/rbd/vol1@s1"))
            .await;
        assert_matches!(result, Err(Error::Backend { .. }));
        assert!(!state.has_volume("rbd", "vol2"));
    }

    #[tokio::test]
    async fn test_read_reports_gone() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");
        let id = reconciler
            .create_volume(&VolumeSpec::sized(pool(), "vol1", 1024))
            .await
            .unwrap()
            .id;

        state.remove_out_of_band("rbd", "vol1");
        assert!(reconciler.read_volume(&id).await.unwrap().is_gone());

        assert_matches!(
            reconciler.read_volume(&path("ceph1/rbd/vol1@s1")).await,
            Err(Error::Format { .. })
        );
    }

    #[tokio::test]
    async fn test_update_commands() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");
        let id = reconciler
            .create_volume(&VolumeSpec::sized(pool(), "vol1", 1024))
            .await
            .unwrap()
            .id;

        assert_matches!(
            reconciler
                .update_volume(&id, &[VolumeChange::SetBase("ceph1/rbd/x@s".into())])
                .await,
            Err(Error::Validation { .. })
        );

        state.clear_mutations();
        reconciler.update_volume(&id, &[VolumeChange::DetachBase]).await.unwrap();
        assert!(state.mutations().is_empty(), "detaching an independent volume is a no-op");

        assert_matches!(
            reconciler.update_volume(&id, &[VolumeChange::Rollback("s1".into())]).await,
            Err(Error::NotFound { .. })
        );

        assert_matches!(
            reconciler
                .update_volume(&path("ceph1/rbd/missing"), &[VolumeChange::DetachBase])
                .await,
            Err(Error::NotFound { .. })
        );
        assert_eq!(state.total_open_handles(), 0);
    }

    #[tokio::test]
    async fn test_rollback_reverts_data() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");
        let id = reconciler
            .create_volume(&VolumeSpec::sized(pool(), "vol1", 1024))
            .await
            .unwrap()
            .id;

        state.write("rbd", "vol1");
        reconciler
            .create_snapshot(&SnapshotSpec::new(id.clone(), "s1", false))
            .await
            .unwrap();
        state.write("rbd", "vol1");
        assert_eq!(state.generation("rbd", "vol1"), Some(2));

        reconciler
            .update_volume(&id, &[VolumeChange::Rollback("s1".into())])
            .await
            .unwrap();
        assert_eq!(state.generation("rbd", "vol1"), Some(1));
    }

    #[test]
    fn test_changes_from_diff() {
        let prior = VolumeSpec::cloned(pool(), "vol2", "ceph1/rbd/vol1@s1");

        let mut desired = prior.clone();
        assert!(desired.changes_from(&prior).is_empty());

        desired.base_snapshot = Some(" ".into());
        desired.rollback_snapshot_name = Some("s1".into());
        assert_eq!(
            desired.changes_from(&prior),
            vec![VolumeChange::DetachBase, VolumeChange::Rollback("s1".into())]
        );

        // unchanged trigger value does not fire again
        let mut next = desired.clone();
        next.size = Some(1024);
        assert!(next.changes_from(&desired).is_empty());

        // clearing the trigger does not fire
        let mut cleared = desired.clone();
        cleared.rollback_snapshot_name = None;
        assert!(cleared.changes_from(&desired).is_empty());

        let mut rebased = prior.clone();
        rebased.base_snapshot = Some("ceph1/rbd/vol1@s2".into());
        assert_eq!(
            rebased.changes_from(&prior),
            vec![VolumeChange::SetBase("ceph1/rbd/vol1@s2".into())]
        );
    }

    #[tokio::test]
    async fn test_delete_absent_and_wait_for_close() {
        let (reconciler, connector, state) = testing::reconciler("ceph1");
        reconciler.delete_volume(&path("ceph1/rbd/missing"), None).await.unwrap();
        let metrics = reconciler.metrics().clone();
        assert_eq!(metrics.operation_count(ResourceKind::Volume, "delete", Outcome::Unchanged), 1);
        assert_eq!(metrics.operation_count(ResourceKind::Volume, "delete", Outcome::Changed), 0);

        let id = reconciler
            .create_volume(&VolumeSpec::sized(pool(), "vol1", 1024))
            .await
            .unwrap()
            .id;

        // another client keeps the image open
        let other = connector.connect("ceph1").await.unwrap();
        let handle = other.lookup_volume("rbd", "vol1").await.unwrap().unwrap();

        let quick = WaitPolicy::new(Duration::from_millis(5), Duration::from_millis(50));
        assert_matches!(
            reconciler.delete_volume(&id, Some(&quick)).await,
            Err(Error::Timeout { .. })
        );

        let closer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.close().await.unwrap();
        });
        let patient = WaitPolicy::new(Duration::from_millis(5), Duration::from_secs(5));
        reconciler.delete_volume(&id, Some(&patient)).await.unwrap();
        closer.await.unwrap();

        assert!(!state.has_volume("rbd", "vol1"));
        assert_eq!(metrics.operation_count(ResourceKind::Volume, "delete", Outcome::Changed), 1);
        assert_eq!(metrics.operation_count(ResourceKind::Volume, "delete", Outcome::Failed), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_allocate_once() {
        let (reconciler, _connector, state) = testing::reconciler("ceph1");
        let reconciler = Arc::new(reconciler);
        let spec = VolumeSpec::sized(pool(), "vol1", 1024);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let reconciler = reconciler.clone();
                let spec = spec.clone();
                tokio::spawn(async move { reconciler.create_volume(&spec).await })
            })
            .collect();

        for task in futures::future::join_all(tasks).await {
            assert_eq!(task.unwrap().unwrap().size, 1024);
        }

        let creates = state
            .mutations()
            .into_iter()
            .filter(|m| m.op == "create_volume")
            .count();
        assert_eq!(creates, 1);
        assert_eq!(state.total_open_handles(), 0);
    }
}
