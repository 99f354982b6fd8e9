//! In-Memory Cluster Adapter
//!
//! A complete fake of the storage cluster for tests and dry runs. It applies
//! the same refusal rules the real cluster does (open images cannot be
//! removed, parents with clones cannot be removed, protected snapshots cannot
//! be removed) and keeps a journal of every mutating call.

use crate::domain::path::ResourcePath;
use crate::domain::ports::{
    ClusterConnector, SnapshotHandle, SnapshotRef, StorageCluster, VolumeHandle, VolumeRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const NO_ENTRY: &str = "No such file or directory";

// =============================================================================
// Journal
// =============================================================================

/// One mutating call observed by the fake cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub op: &'static str,
    pub target: String,
}

// =============================================================================
// Cluster State
// =============================================================================

#[derive(Debug, Clone)]
struct Snap {
    protected: bool,
    generation: u64,
}

#[derive(Debug, Clone)]
struct Image {
    size: u64,
    parent: Option<ResourcePath>,
    snapshots: BTreeMap<String, Snap>,
    open_handles: u32,
    /// Bumped on every write; rollback restores the snapshot's value
    generation: u64,
}

impl Image {
    fn new(size: u64, parent: Option<ResourcePath>, generation: u64) -> Self {
        Self {
            size,
            parent,
            snapshots: BTreeMap::new(),
            open_handles: 1,
            generation,
        }
    }
}

#[derive(Debug, Default)]
struct ClusterData {
    pools: BTreeMap<String, BTreeMap<String, Image>>,
    journal: Vec<Mutation>,
    deny_pool_delete: bool,
}

impl ClusterData {
    fn record(&mut self, op: &'static str, target: String) {
        debug!("Memory: {} {}", op, target);
        self.journal.push(Mutation { op, target });
    }

    fn image(&self, pool: &str, name: &str) -> Option<&Image> {
        self.pools.get(pool).and_then(|images| images.get(name))
    }

    fn image_mut(&mut self, pool: &str, name: &str) -> Option<&mut Image> {
        self.pools.get_mut(pool).and_then(|images| images.get_mut(name))
    }

    /// Number of images cloned from `parent`
    fn children(&self, parent: &ResourcePath) -> usize {
        self.pools
            .values()
            .flat_map(|images| images.values())
            .filter(|image| image.parent.as_ref() == Some(parent))
            .count()
    }
}

/// State of one fake cluster, shared by every session opened against it
#[derive(Debug)]
pub struct MemoryClusterState {
    cluster: String,
    data: Mutex<ClusterData>,
}

impl MemoryClusterState {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            data: Mutex::new(ClusterData::default()),
        }
    }

    /// Add a pool without journaling it
    pub fn seed_pool(&self, pool: &str) {
        self.data.lock().pools.entry(pool.to_string()).or_default();
    }

    pub fn has_pool(&self, pool: &str) -> bool {
        self.data.lock().pools.contains_key(pool)
    }

    pub fn has_volume(&self, pool: &str, name: &str) -> bool {
        self.data.lock().image(pool, name).is_some()
    }

    pub fn has_snapshot(&self, pool: &str, volume: &str, snapshot: &str) -> bool {
        self.data
            .lock()
            .image(pool, volume)
            .map_or(false, |image| image.snapshots.contains_key(snapshot))
    }

    pub fn is_protected(&self, pool: &str, volume: &str, snapshot: &str) -> Option<bool> {
        self.data
            .lock()
            .image(pool, volume)
            .and_then(|image| image.snapshots.get(snapshot))
            .map(|snap| snap.protected)
    }

    /// Open handles on one image
    pub fn open_handles(&self, pool: &str, name: &str) -> u32 {
        self.data
            .lock()
            .image(pool, name)
            .map_or(0, |image| image.open_handles)
    }

    /// Open handles across the whole cluster
    pub fn total_open_handles(&self) -> u32 {
        self.data
            .lock()
            .pools
            .values()
            .flat_map(|images| images.values())
            .map(|image| image.open_handles)
            .sum()
    }

    /// Simulate a client writing to the image
    pub fn write(&self, pool: &str, name: &str) {
        if let Some(image) = self.data.lock().image_mut(pool, name) {
            image.generation += 1;
        }
    }

    pub fn generation(&self, pool: &str, name: &str) -> Option<u64> {
        self.data.lock().image(pool, name).map(|image| image.generation)
    }

    /// Remove an image behind the reconciler's back
    pub fn remove_out_of_band(&self, pool: &str, name: &str) {
        if let Some(images) = self.data.lock().pools.get_mut(pool) {
            images.remove(name);
        }
    }

    /// Remove a snapshot behind the reconciler's back
    pub fn remove_snapshot_out_of_band(&self, pool: &str, volume: &str, snapshot: &str) {
        if let Some(image) = self.data.lock().image_mut(pool, volume) {
            image.snapshots.remove(snapshot);
        }
    }

    /// Make pool deletion fail with permission denied
    pub fn set_deny_pool_delete(&self, deny: bool) {
        self.data.lock().deny_pool_delete = deny;
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.data.lock().journal.clone()
    }

    pub fn clear_mutations(&self) {
        self.data.lock().journal.clear();
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Connector handing out sessions to fake clusters
#[derive(Debug, Default)]
pub struct MemoryConnector {
    clusters: DashMap<String, Arc<MemoryClusterState>>,
    connects: DashMap<String, u64>,
    failing: Mutex<HashSet<String>>,
    connect_delay: Mutex<Option<Duration>>,
}

impl MemoryConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// State of `cluster`, created empty on first reference
    pub fn cluster_state(&self, cluster: &str) -> Arc<MemoryClusterState> {
        self.clusters
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(MemoryClusterState::new(cluster)))
            .value()
            .clone()
    }

    /// Number of successful connects to `cluster`
    pub fn connect_count(&self, cluster: &str) -> u64 {
        self.connects.get(cluster).map_or(0, |count| *count.value())
    }

    /// Make connects to `cluster` fail until reset
    pub fn fail_connect(&self, cluster: &str, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(cluster.to_string());
        } else {
            failing.remove(cluster);
        }
    }

    /// Delay every connect, widening race windows in tests
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }
}

#[async_trait]
impl ClusterConnector for MemoryConnector {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn StorageCluster>> {
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(cluster) {
            return Err(Error::Connection {
                cluster: cluster.to_string(),
                reason: format!("unable to read configuration for '{}'", cluster),
            });
        }

        *self.connects.entry(cluster.to_string()).or_insert(0) += 1;
        Ok(Arc::new(MemoryCluster {
            state: self.cluster_state(cluster),
            connected: AtomicBool::new(true),
        }))
    }
}

// =============================================================================
// Cluster Session
// =============================================================================

/// A session against a fake cluster
#[derive(Debug)]
pub struct MemoryCluster {
    state: Arc<MemoryClusterState>,
    connected: AtomicBool,
}

impl MemoryCluster {
    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::Connection {
                cluster: self.state.cluster.clone(),
                reason: "connection closed".to_string(),
            })
        }
    }

    fn open(&self, path: ResourcePath) -> VolumeRef {
        Box::new(MemoryVolume {
            state: self.state.clone(),
            path,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl StorageCluster for MemoryCluster {
    fn cluster(&self) -> &str {
        &self.state.cluster
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn version(&self) -> Result<String> {
        self.ensure_connected()?;
        Ok(format!(
            "ceph version {} (in-memory) {}",
            crate::VERSION,
            self.state.cluster
        ))
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        self.ensure_connected()?;
        Ok(self.state.has_pool(pool))
    }

    async fn create_pool(&self, pool: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut data = self.state.data.lock();
        if data.pools.contains_key(pool) {
            return Err(Error::backend("create pool", pool, "File exists"));
        }
        data.pools.insert(pool.to_string(), BTreeMap::new());
        data.record("create_pool", pool.to_string());
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        self.ensure_connected()?;
        let mut data = self.state.data.lock();
        if data.deny_pool_delete {
            return Err(Error::PermissionDenied {
                operation: "delete pool".to_string(),
                target: pool.to_string(),
            });
        }
        if data.pools.remove(pool).is_some() {
            data.record("delete_pool", pool.to_string());
        }
        Ok(())
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeRef>> {
        self.ensure_connected()?;
        let mut data = self.state.data.lock();
        let images = data.pools.get_mut(pool).ok_or_else(|| {
            Error::backend("open pool", pool, NO_ENTRY)
        })?;
        let Some(image) = images.get_mut(name) else {
            return Ok(None);
        };
        image.open_handles += 1;
        drop(data);

        let path = ResourcePath::volume(self.state.cluster.clone(), pool, name)?;
        Ok(Some(self.open(path)))
    }

    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<VolumeRef> {
        self.ensure_connected()?;
        let path = ResourcePath::volume(self.state.cluster.clone(), pool, name)?;
        let mut data = self.state.data.lock();
        let images = data
            .pools
            .get_mut(pool)
            .ok_or_else(|| Error::backend("open pool", pool, NO_ENTRY))?;
        if images.contains_key(name) {
            return Err(Error::backend("create image", path.image_spec(), "File exists"));
        }
        images.insert(name.to_string(), Image::new(size, None, 0));
        data.record("create_volume", path.image_spec());
        drop(data);

        Ok(self.open(path))
    }

    async fn clone_volume(&self, base: &ResourcePath, pool: &str, name: &str) -> Result<VolumeRef> {
        self.ensure_connected()?;
        let path = ResourcePath::volume(self.state.cluster.clone(), pool, name)?;
        let snap_name = base.snapshot_name().ok_or_else(|| {
            Error::backend("clone image", base.image_spec(), "missing snapshot name")
        })?;

        let mut data = self.state.data.lock();
        let (size, generation) = data
            .image(base.pool(), base.name())
            .and_then(|image| image.snapshots.get(snap_name).map(|snap| (image.size, snap.generation)))
            .ok_or_else(|| Error::backend("clone image", base.image_spec(), NO_ENTRY))?;

        let images = data
            .pools
            .get_mut(pool)
            .ok_or_else(|| Error::backend("open pool", pool, NO_ENTRY))?;
        if images.contains_key(name) {
            return Err(Error::backend("clone image", path.image_spec(), "File exists"));
        }

        let parent = ResourcePath::snapshot(self.state.cluster.clone(), base.pool(), base.name(), snap_name)?;
        images.insert(name.to_string(), Image::new(size, Some(parent), generation));
        data.record("clone_volume", format!("{} -> {}", base.image_spec(), path.image_spec()));
        drop(data);

        Ok(self.open(path))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<bool> {
        self.ensure_connected()?;
        let target = format!("{}/{}", pool, name);
        let mut data = self.state.data.lock();
        let Some(image) = data.image(pool, name) else {
            return Ok(false);
        };

        if image.open_handles > 0 {
            return Err(Error::backend("remove image", target, "image still open (Device or resource busy)"));
        }
        if !image.snapshots.is_empty() {
            let cloned = image.snapshots.keys().any(|snap| {
                ResourcePath::snapshot(self.state.cluster.clone(), pool, name, snap.clone())
                    .map_or(false, |parent| data.children(&parent) > 0)
            });
            let reason = if cloned {
                "image has snapshots with dependent clones, parent still referenced"
            } else {
                "image has snapshots"
            };
            return Err(Error::backend("remove image", target, reason));
        }

        if let Some(images) = data.pools.get_mut(pool) {
            images.remove(name);
        }
        data.record("delete_volume", target);
        Ok(true)
    }

    async fn shutdown(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

// =============================================================================
// Volume Handle
// =============================================================================

/// An open image in a fake cluster
#[derive(Debug)]
pub struct MemoryVolume {
    state: Arc<MemoryClusterState>,
    path: ResourcePath,
    closed: AtomicBool,
}

impl MemoryVolume {
    fn with_image<T>(&self, op: &str, f: impl FnOnce(&mut ClusterData, &ResourcePath) -> Result<T>) -> Result<T> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::backend(op, self.path.image_spec(), "image handle closed"));
        }
        let mut data = self.state.data.lock();
        if data.image(self.path.pool(), self.path.name()).is_none() {
            return Err(Error::backend(op, self.path.image_spec(), NO_ENTRY));
        }
        f(&mut *data, &self.path)
    }
}

/// Image addressed by a handle; the caller has already checked it exists
fn open_image<'a>(data: &'a mut ClusterData, path: &ResourcePath) -> Result<&'a mut Image> {
    data.image_mut(path.pool(), path.name())
        .ok_or_else(|| Error::backend("open image", path.image_spec(), NO_ENTRY))
}

#[async_trait]
impl VolumeHandle for MemoryVolume {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    async fn parent(&self) -> Result<Option<ResourcePath>> {
        self.with_image("get parent", |data, path| Ok(open_image(data, path)?.parent.clone()))
    }

    async fn size(&self) -> Result<u64> {
        self.with_image("get size", |data, path| Ok(open_image(data, path)?.size))
    }

    async fn flatten(&self) -> Result<()> {
        self.with_image("flatten", |data, path| {
            let image = open_image(data, path)?;
            if image.parent.take().is_none() {
                return Err(Error::backend("flatten", path.image_spec(), "image has no parent"));
            }
            data.record("flatten", path.image_spec());
            Ok(())
        })
    }

    async fn lookup_snapshot(&self, name: &str) -> Result<Option<SnapshotRef>> {
        let found = self.with_image("list snapshots", |data, path| {
            Ok(open_image(data, path)?.snapshots.contains_key(name))
        })?;
        if !found {
            return Ok(None);
        }
        Ok(Some(Box::new(MemorySnapshot {
            state: self.state.clone(),
            path: self.path.with_snapshot(name)?,
        })))
    }

    async fn create_snapshot(&self, name: &str) -> Result<SnapshotRef> {
        let snap_path = self.path.with_snapshot(name)?;
        self.with_image("create snapshot", |data, path| {
            let image = open_image(data, path)?;
            if image.snapshots.contains_key(name) {
                return Err(Error::backend("create snapshot", snap_path.image_spec(), "File exists"));
            }
            let generation = image.generation;
            image.snapshots.insert(
                name.to_string(),
                Snap {
                    protected: false,
                    generation,
                },
            );
            data.record("create_snapshot", snap_path.image_spec());
            Ok(())
        })?;

        Ok(Box::new(MemorySnapshot {
            state: self.state.clone(),
            path: snap_path,
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(image) = self.state.data.lock().image_mut(self.path.pool(), self.path.name()) {
            image.open_handles = image.open_handles.saturating_sub(1);
        }
        Ok(())
    }
}

// =============================================================================
// Snapshot Handle
// =============================================================================

/// A snapshot of an image in a fake cluster
#[derive(Debug)]
pub struct MemorySnapshot {
    state: Arc<MemoryClusterState>,
    path: ResourcePath,
}

impl MemorySnapshot {
    fn snap_name(&self) -> &str {
        self.path.snapshot_name().unwrap_or_default()
    }

    fn with_snap<T>(&self, op: &str, f: impl FnOnce(&mut ClusterData, &mut Snap, usize) -> Result<T>) -> Result<T> {
        let mut data = self.state.data.lock();
        let children = data.children(&self.path);
        let mut snap = data
            .image(self.path.pool(), self.path.name())
            .and_then(|image| image.snapshots.get(self.snap_name()))
            .cloned()
            .ok_or_else(|| Error::backend(op, self.path.image_spec(), NO_ENTRY))?;

        let result = f(&mut *data, &mut snap, children)?;

        if let Some(image) = data.image_mut(self.path.pool(), self.path.name()) {
            if let Some(stored) = image.snapshots.get_mut(self.snap_name()) {
                *stored = snap;
            }
        }
        Ok(result)
    }
}

#[async_trait]
impl SnapshotHandle for MemorySnapshot {
    fn name(&self) -> &str {
        self.snap_name()
    }

    async fn is_protected(&self) -> Result<bool> {
        self.with_snap("is protected", |_, snap, _| Ok(snap.protected))
    }

    async fn protect(&self) -> Result<()> {
        let target = self.path.image_spec();
        self.with_snap("protect", |data, snap, _| {
            if snap.protected {
                return Err(Error::backend("protect", target, "snapshot already protected"));
            }
            snap.protected = true;
            data.record("protect", target);
            Ok(())
        })
    }

    async fn unprotect(&self) -> Result<()> {
        let target = self.path.image_spec();
        self.with_snap("unprotect", |data, snap, children| {
            if !snap.protected {
                return Err(Error::backend("unprotect", target, "snapshot is not protected"));
            }
            if children > 0 {
                return Err(Error::backend("unprotect", target, "snapshot has dependent clones"));
            }
            snap.protected = false;
            data.record("unprotect", target);
            Ok(())
        })
    }

    async fn rollback(&self) -> Result<()> {
        let target = self.path.image_spec();
        let (pool, name) = (self.path.pool().to_string(), self.path.name().to_string());
        self.with_snap("rollback", |data, snap, _| {
            let generation = snap.generation;
            if let Some(image) = data.image_mut(&pool, &name) {
                image.generation = generation;
            }
            data.record("rollback", target);
            Ok(())
        })
    }

    async fn remove(&self) -> Result<()> {
        let target = self.path.image_spec();
        let mut data = self.state.data.lock();
        let children = data.children(&self.path);
        let image = data
            .image_mut(self.path.pool(), self.path.name())
            .ok_or_else(|| Error::backend("remove snapshot", target.clone(), NO_ENTRY))?;
        let snap = image
            .snapshots
            .get(self.snap_name())
            .ok_or_else(|| Error::backend("remove snapshot", target.clone(), NO_ENTRY))?;

        if snap.protected {
            return Err(Error::backend("remove snapshot", target, "snapshot is protected"));
        }
        if children > 0 {
            return Err(Error::backend("remove snapshot", target, "snapshot has dependent clones"));
        }
        image.snapshots.remove(self.snap_name());
        data.record("remove_snapshot", target);
        Ok(())
    }
}
