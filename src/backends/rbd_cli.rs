//! rbd/ceph CLI Adapter
//!
//! Drives a real cluster through the stock `ceph` and `rbd` tools. The
//! cluster identifier selects the configuration file
//! `{conf_dir}/{cluster}.conf`; an empty identifier uses the tools' default
//! configuration. Read commands request `--format json` output.

use super::command::{exec_unchecked, CommandOutput};
use crate::domain::path::ResourcePath;
use crate::domain::ports::{
    ClusterConnector, SnapshotHandle, SnapshotRef, StorageCluster, VolumeHandle, VolumeRef,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// 4 MiB objects, matching the layout of images created by the provisioner
const OBJECT_SIZE: &str = "4M";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the CLI adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RbdCliConfig {
    /// Directory holding `{cluster}.conf` files
    pub conf_dir: PathBuf,
    pub ceph_bin: String,
    pub rbd_bin: String,
    /// Seconds the tools wait for the monitors
    pub connect_timeout_secs: u64,
}

impl Default for RbdCliConfig {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from("/etc/ceph"),
            ceph_bin: "ceph".to_string(),
            rbd_bin: "rbd".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

impl RbdCliConfig {
    /// Configuration file for `cluster`, `None` for the default configuration
    pub fn conf_path(&self, cluster: &str) -> Option<PathBuf> {
        if cluster.is_empty() {
            None
        } else {
            Some(self.conf_dir.join(format!("{}.conf", cluster)))
        }
    }
}

// =============================================================================
// JSON Output
// =============================================================================

#[derive(Debug, Deserialize)]
struct VersionInfo {
    version: String,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    size: u64,
    #[serde(default)]
    parent: Option<ParentInfo>,
}

#[derive(Debug, Deserialize)]
struct ParentInfo {
    pool: String,
    image: String,
    snapshot: String,
}

/// `rbd snap ls` reports protection as `"true"`/`"false"`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapInfo {
    name: String,
    #[serde(default)]
    protected: Option<Flag>,
}

fn parse_pool_list(stdout: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(stdout)?)
}

fn parse_version(stdout: &str) -> Result<String> {
    let info: VersionInfo = serde_json::from_str(stdout)?;
    Ok(info.version)
}

/// Cluster version followed by the version of the local rbd client
fn combine_versions(cluster: &str, client_stdout: &str) -> String {
    match client_stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(client) => format!("{}; rbd client: {}", cluster, client),
        None => cluster.to_string(),
    }
}

fn parse_image_info(stdout: &str) -> Result<ImageInfo> {
    Ok(serde_json::from_str(stdout)?)
}

fn parse_snapshots(stdout: &str) -> Result<Vec<SnapInfo>> {
    Ok(serde_json::from_str(stdout)?)
}

// =============================================================================
// Command Runner
// =============================================================================

/// Issues commands against one cluster
#[derive(Debug)]
struct Runner {
    cluster: String,
    base_args: Vec<String>,
    ceph_bin: String,
    rbd_bin: String,
}

impl Runner {
    fn new(cluster: &str, config: &RbdCliConfig) -> Self {
        let mut base_args = Vec::new();
        if let Some(conf) = config.conf_path(cluster) {
            base_args.push("-c".to_string());
            base_args.push(conf.display().to_string());
        }
        base_args.push("--connect-timeout".to_string());
        base_args.push(config.connect_timeout_secs.to_string());

        Self {
            cluster: cluster.to_string(),
            base_args,
            ceph_bin: config.ceph_bin.clone(),
            rbd_bin: config.rbd_bin.clone(),
        }
    }

    fn args(&self, extra: &[&str]) -> Vec<String> {
        self.base_args
            .iter()
            .cloned()
            .chain(extra.iter().map(|a| a.to_string()))
            .collect()
    }

    async fn ceph(&self, extra: &[&str]) -> Result<CommandOutput> {
        exec_unchecked(&self.ceph_bin, &self.args(extra)).await
    }

    async fn rbd(&self, extra: &[&str]) -> Result<CommandOutput> {
        exec_unchecked(&self.rbd_bin, &self.args(extra)).await
    }

    /// `rbd --version`; needs no cluster configuration
    async fn rbd_client_version(&self) -> Result<CommandOutput> {
        exec_unchecked(&self.rbd_bin, &["--version".to_string()]).await
    }

    /// `rbd info`, `None` when the image does not exist
    async fn image_info(&self, spec: &str) -> Result<Option<ImageInfo>> {
        let output = self.rbd(&["info", spec, "--format", "json"]).await?;
        if output.is_not_found() {
            return Ok(None);
        }
        let output = output.check("image info", spec)?;
        parse_image_info(&output.stdout).map(Some)
    }

    async fn require_image(&self, spec: &str) -> Result<ImageInfo> {
        self.image_info(spec)
            .await?
            .ok_or_else(|| Error::backend("image info", spec, "No such file or directory"))
    }

    async fn snapshots(&self, spec: &str) -> Result<Vec<SnapInfo>> {
        let output = self
            .rbd(&["snap", "ls", spec, "--format", "json"])
            .await?
            .check("list snapshots", spec)?;
        parse_snapshots(&output.stdout)
    }

    fn volume(self: &Arc<Self>, path: ResourcePath) -> VolumeRef {
        Box::new(RbdCliVolume {
            runner: self.clone(),
            path,
        })
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Connector opening CLI-backed sessions
#[derive(Debug, Default)]
pub struct RbdCliConnector {
    config: RbdCliConfig,
}

impl RbdCliConnector {
    pub fn new(config: RbdCliConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClusterConnector for RbdCliConnector {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn StorageCluster>> {
        let connection_err = |reason: String| Error::Connection {
            cluster: cluster.to_string(),
            reason,
        };

        if let Some(conf) = self.config.conf_path(cluster) {
            tokio::fs::metadata(&conf).await.map_err(|e| {
                connection_err(format!("unable to read configuration file {}: {}", conf.display(), e))
            })?;
        }

        let runner = Arc::new(Runner::new(cluster, &self.config));
        let output = runner.ceph(&["fsid", "--format", "json"]).await?;
        if !output.success() {
            return Err(connection_err(output.stderr.trim().to_string()));
        }

        info!("Connected to ceph cluster '{}' via CLI", cluster);
        Ok(Arc::new(RbdCliCluster {
            runner,
            connected: AtomicBool::new(true),
        }))
    }
}

// =============================================================================
// Cluster Session
// =============================================================================

/// A CLI-backed cluster session. The tools hold no state between commands.
#[derive(Debug)]
pub struct RbdCliCluster {
    runner: Arc<Runner>,
    connected: AtomicBool,
}

#[async_trait]
impl StorageCluster for RbdCliCluster {
    fn cluster(&self) -> &str {
        &self.runner.cluster
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn version(&self) -> Result<String> {
        let output = self
            .runner
            .ceph(&["version", "--format", "json"])
            .await?
            .check("version", &self.runner.cluster)?;
        let cluster_version = parse_version(&output.stdout)?;

        let client = self
            .runner
            .rbd_client_version()
            .await?
            .check("rbd client version", &self.runner.rbd_bin)?;
        Ok(combine_versions(&cluster_version, &client.stdout))
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool> {
        let output = self
            .runner
            .ceph(&["osd", "pool", "ls", "--format", "json"])
            .await?
            .check("list pools", pool)?;
        Ok(parse_pool_list(&output.stdout)?.iter().any(|p| p == pool))
    }

    async fn create_pool(&self, pool: &str) -> Result<()> {
        self.runner
            .ceph(&["osd", "pool", "create", pool])
            .await?
            .check("create pool", pool)?;
        Ok(())
    }

    async fn delete_pool(&self, pool: &str) -> Result<()> {
        if !self.pool_exists(pool).await? {
            return Ok(());
        }
        self.runner
            .ceph(&["osd", "pool", "delete", pool, pool, "--yes-i-really-really-mean-it"])
            .await?
            .check("delete pool", pool)?;
        Ok(())
    }

    async fn lookup_volume(&self, pool: &str, name: &str) -> Result<Option<VolumeRef>> {
        let path = ResourcePath::volume(self.runner.cluster.clone(), pool, name)?;
        match self.runner.image_info(&path.image_spec()).await? {
            Some(_) => Ok(Some(self.runner.volume(path))),
            None => Ok(None),
        }
    }

    async fn create_volume(&self, pool: &str, name: &str, size: u64) -> Result<VolumeRef> {
        let path = ResourcePath::volume(self.runner.cluster.clone(), pool, name)?;
        let spec = path.image_spec();
        let size = format!("{}B", size);
        self.runner
            .rbd(&["create", "--size", &size, "--object-size", OBJECT_SIZE, &spec])
            .await?
            .check("create image", &spec)?;
        Ok(self.runner.volume(path))
    }

    async fn clone_volume(&self, base: &ResourcePath, pool: &str, name: &str) -> Result<VolumeRef> {
        let path = ResourcePath::volume(self.runner.cluster.clone(), pool, name)?;
        let spec = path.image_spec();
        let base_spec = base.image_spec();
        self.runner
            .rbd(&[
                "clone",
                "--image-feature",
                "layering",
                "--object-size",
                OBJECT_SIZE,
                &base_spec,
                &spec,
            ])
            .await?
            .check("clone image", &base_spec)?;
        Ok(self.runner.volume(path))
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<bool> {
        let spec = format!("{}/{}", pool, name);
        let output = self.runner.rbd(&["rm", "--no-progress", &spec]).await?;
        if output.is_not_found() {
            debug!("image {} already absent", spec);
            return Ok(false);
        }
        output.check("remove image", &spec)?;
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

#[derive(Debug)]
pub struct RbdCliVolume {
    runner: Arc<Runner>,
    path: ResourcePath,
}

#[async_trait]
impl VolumeHandle for RbdCliVolume {
    fn path(&self) -> &ResourcePath {
        &self.path
    }

    async fn parent(&self) -> Result<Option<ResourcePath>> {
        let info = self.runner.require_image(&self.path.image_spec()).await?;
        info.parent
            .map(|p| ResourcePath::snapshot(self.runner.cluster.clone(), p.pool, p.image, p.snapshot))
            .transpose()
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.runner.require_image(&self.path.image_spec()).await?.size)
    }

    async fn flatten(&self) -> Result<()> {
        let spec = self.path.image_spec();
        self.runner
            .rbd(&["flatten", "--no-progress", &spec])
            .await?
            .check("flatten", &spec)?;
        Ok(())
    }

    async fn lookup_snapshot(&self, name: &str) -> Result<Option<SnapshotRef>> {
        let snaps = self.runner.snapshots(&self.path.image_spec()).await?;
        if !snaps.iter().any(|s| s.name == name) {
            return Ok(None);
        }
        Ok(Some(Box::new(RbdCliSnapshot {
            runner: self.runner.clone(),
            path: self.path.with_snapshot(name)?,
        })))
    }

    async fn create_snapshot(&self, name: &str) -> Result<SnapshotRef> {
        let path = self.path.with_snapshot(name)?;
        let spec = path.image_spec();
        self.runner
            .rbd(&["snap", "create", "--no-progress", &spec])
            .await?
            .check("create snapshot", &spec)?;
        Ok(Box::new(RbdCliSnapshot {
            runner: self.runner.clone(),
            path,
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Snapshot Handle
// =============================================================================

#[derive(Debug)]
pub struct RbdCliSnapshot {
    runner: Arc<Runner>,
    path: ResourcePath,
}

impl RbdCliSnapshot {
    async fn snap(&self, action: &str, operation: &str) -> Result<()> {
        let spec = self.path.image_spec();
        self.runner
            .rbd(&["snap", action, "--no-progress", &spec])
            .await?
            .check(operation, &spec)?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotHandle for RbdCliSnapshot {
    fn name(&self) -> &str {
        self.path.snapshot_name().unwrap_or_default()
    }

    async fn is_protected(&self) -> Result<bool> {
        let snaps = self.runner.snapshots(&self.path.volume_path().image_spec()).await?;
        snaps
            .iter()
            .find(|s| s.name == self.name())
            .map(|s| s.protected.as_ref().map_or(false, Flag::is_set))
            .ok_or_else(|| Error::backend("is protected", self.path.image_spec(), "No such file or directory"))
    }

    async fn protect(&self) -> Result<()> {
        let spec = self.path.image_spec();
        self.runner
            .rbd(&["snap", "protect", &spec])
            .await?
            .check("protect", &spec)?;
        Ok(())
    }

    async fn unprotect(&self) -> Result<()> {
        let spec = self.path.image_spec();
        self.runner
            .rbd(&["snap", "unprotect", &spec])
            .await?
            .check("unprotect", &spec)?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.snap("rollback", "rollback").await
    }

    async fn remove(&self) -> Result<()> {
        self.snap("rm", "remove snapshot").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_path() {
        let config = RbdCliConfig::default();
        assert_eq!(
            config.conf_path("ceph1"),
            Some(PathBuf::from("/etc/ceph/ceph1.conf"))
        );
        assert_eq!(config.conf_path(""), None);
    }

    #[test]
    fn test_runner_base_args() {
        let runner = Runner::new("ceph1", &RbdCliConfig::default());
        assert_eq!(
            runner.args(&["osd", "pool", "ls"]),
            vec!["-c", "/etc/ceph/ceph1.conf", "--connect-timeout", "30", "osd", "pool", "ls"]
        );

        let runner = Runner::new("", &RbdCliConfig::default());
        assert_eq!(runner.args(&["fsid"]), vec!["--connect-timeout", "30", "fsid"]);
    }

    #[test]
    fn test_parse_image_info() {
        let plain = r#"{"name":"vol1","id":"10226b8b4567","size":1024,"objects":1,"order":22,"object_size":4194304}"#;
        let info = parse_image_info(plain).unwrap();
        assert_eq!(info.size, 1024);
        assert!(info.parent.is_none());

        let clone = r#"{"name":"vol2","size":1024,"parent":{"pool":"rbd","pool_namespace":"","image":"vol1","id":"10226b8b4567","snapshot":"s1","trash":false,"overlap":1024}}"#;
        let parent = parse_image_info(clone).unwrap().parent.unwrap();
        assert_eq!((parent.pool.as_str(), parent.image.as_str(), parent.snapshot.as_str()), ("rbd", "vol1", "s1"));
    }

    #[test]
    fn test_parse_snapshots() {
        let out = r#"[{"id":4,"name":"s1","size":1024,"protected":"true","timestamp":"Mon Jan  1 00:00:00 2024"},{"id":5,"name":"s2","size":1024,"protected":false}]"#;
        let snaps = parse_snapshots(out).unwrap();
        assert_eq!(snaps.len(), 2);
        assert!(snaps[0].protected.as_ref().unwrap().is_set());
        assert!(!snaps[1].protected.as_ref().unwrap().is_set());
    }

    #[test]
    fn test_parse_pools_and_version() {
        assert_eq!(parse_pool_list(r#"["rbd","images"]"#).unwrap(), vec!["rbd", "images"]);
        assert_eq!(
            parse_version(r#"{"version":"ceph version 17.2.6 (d7ff0d10654d2280e08f1ab989c7cdf3064446a5) quincy (stable)"}"#).unwrap(),
            "ceph version 17.2.6 (d7ff0d10654d2280e08f1ab989c7cdf3064446a5) quincy (stable)"
        );
        assert!(parse_pool_list("not json").is_err());
    }

    #[test]
    fn test_combine_versions() {
        assert_eq!(
            combine_versions(
                "ceph version 17.2.6 quincy (stable)",
                "ceph version 17.2.7 quincy (stable)\n"
            ),
            "ceph version 17.2.6 quincy (stable); rbd client: ceph version 17.2.7 quincy (stable)"
        );
        assert_eq!(combine_versions("ceph version 18.2.0", "\n"), "ceph version 18.2.0");
    }

    #[tokio::test]
    async fn test_connect_requires_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let connector = RbdCliConnector::new(RbdCliConfig {
            conf_dir: dir.path().to_path_buf(),
            ..RbdCliConfig::default()
        });

        let err = connector.connect("missing").await.err().unwrap();
        assert!(matches!(err, Error::Connection { ref cluster, .. } if cluster == "missing"));
    }
}
