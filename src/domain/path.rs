//! Resource Path Model
//!
//! Compound identifiers that name every entity the reconcilers manage:
//!
//! - pool: `{cluster}/{pool}`
//! - volume: `{cluster}/{pool}/{volume}`
//! - snapshot: `{cluster}/{pool}/{volume}@{snapshot}`
//!
//! Formatting a parsed identifier reproduces the input exactly.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const POOL_FORMAT: &str = "{cluster}/{pool}";
const VOLUME_FORMAT: &str = "{cluster}/{pool}/{volume}[@{snapshot}]";

/// A segment must be non-empty, free of separators and of surrounding
/// whitespace, so that formatting and parsing stay exact inverses.
fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.contains(['/', '@'])
        && segment.trim() == segment
}

fn valid_snapshot(snapshot: &str) -> bool {
    !snapshot.is_empty() && !snapshot.contains('/') && snapshot.trim() == snapshot
}

// =============================================================================
// Pool ID
// =============================================================================

/// Identifier of a pool within a cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoolId {
    cluster: String,
    pool: String,
}

impl PoolId {
    pub fn new(cluster: impl Into<String>, pool: impl Into<String>) -> Result<Self> {
        let id = Self {
            cluster: cluster.into(),
            pool: pool.into(),
        };
        if !valid_segment(&id.cluster) || !valid_segment(&id.pool) {
            return Err(Error::Format {
                input: id.to_string(),
                expected: POOL_FORMAT,
            });
        }
        Ok(id)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Path of a volume inside this pool
    pub fn volume(&self, name: impl Into<String>) -> Result<ResourcePath> {
        ResourcePath::volume(self.cluster.clone(), self.pool.clone(), name)
    }
}

impl FromStr for PoolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let format_err = || Error::Format {
            input: s.to_string(),
            expected: POOL_FORMAT,
        };

        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [cluster, pool] => PoolId::new(*cluster, *pool).map_err(|_| format_err()),
            _ => Err(format_err()),
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.pool)
    }
}

impl TryFrom<String> for PoolId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<PoolId> for String {
    fn from(id: PoolId) -> Self {
        id.to_string()
    }
}

// =============================================================================
// Resource Path
// =============================================================================

/// Path of a volume, optionally qualified with a snapshot name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourcePath {
    cluster: String,
    pool: String,
    name: String,
    snapshot: Option<String>,
}

impl ResourcePath {
    /// Path of a volume
    pub fn volume(
        cluster: impl Into<String>,
        pool: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self> {
        Self::build(cluster.into(), pool.into(), name.into(), None)
    }

    /// Path of a snapshot of a volume
    pub fn snapshot(
        cluster: impl Into<String>,
        pool: impl Into<String>,
        name: impl Into<String>,
        snapshot: impl Into<String>,
    ) -> Result<Self> {
        Self::build(
            cluster.into(),
            pool.into(),
            name.into(),
            Some(snapshot.into()),
        )
    }

    fn build(cluster: String, pool: String, name: String, snapshot: Option<String>) -> Result<Self> {
        let path = Self {
            cluster,
            pool,
            name,
            snapshot,
        };
        let bad_segment = [&path.cluster, &path.pool, &path.name]
            .iter()
            .any(|s| !valid_segment(s));
        let bad_snapshot = path.snapshot.as_deref().map_or(false, |s| !valid_snapshot(s));
        if bad_segment || bad_snapshot {
            return Err(Error::Format {
                input: path.to_string(),
                expected: VOLUME_FORMAT,
            });
        }
        Ok(path)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Volume name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot_name(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn pool_id(&self) -> PoolId {
        PoolId {
            cluster: self.cluster.clone(),
            pool: self.pool.clone(),
        }
    }

    /// The volume this path refers to, without any snapshot qualifier
    pub fn volume_path(&self) -> ResourcePath {
        Self {
            snapshot: None,
            ..self.clone()
        }
    }

    /// Qualify the volume with a snapshot name
    pub fn with_snapshot(&self, snapshot: impl Into<String>) -> Result<ResourcePath> {
        Self::build(
            self.cluster.clone(),
            self.pool.clone(),
            self.name.clone(),
            Some(snapshot.into()),
        )
    }

    /// `{pool}/{volume}` as understood by the rbd tooling
    pub fn image_spec(&self) -> String {
        match &self.snapshot {
            Some(snap) => format!("{}/{}@{}", self.pool, self.name, snap),
            None => format!("{}/{}", self.pool, self.name),
        }
    }

    /// Parse a volume path, rejecting snapshot-qualified input
    pub fn parse_volume(s: &str) -> Result<Self> {
        let path: ResourcePath = s.parse()?;
        if path.is_snapshot() {
            return Err(Error::Format {
                input: s.to_string(),
                expected: "{cluster}/{pool}/{volume}",
            });
        }
        Ok(path)
    }

    /// Parse a snapshot path, requiring the `@{snapshot}` qualifier
    pub fn parse_snapshot(s: &str) -> Result<Self> {
        let path: ResourcePath = s.parse()?;
        if !path.is_snapshot() {
            return Err(Error::Format {
                input: s.to_string(),
                expected: "{cluster}/{pool}/{volume}@{snapshot}",
            });
        }
        Ok(path)
    }
}

impl FromStr for ResourcePath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let format_err = || Error::Format {
            input: s.to_string(),
            expected: VOLUME_FORMAT,
        };

        let parts: Vec<&str> = s.split('/').collect();
        let [cluster, pool, last] = parts.as_slice() else {
            return Err(format_err());
        };

        let (name, snapshot) = match last.split_once('@') {
            Some((name, snap)) => (name, Some(snap.to_string())),
            None => (*last, None),
        };

        Self::build(cluster.to_string(), pool.to_string(), name.to_string(), snapshot)
            .map_err(|_| format_err())
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster, self.pool, self.name)?;
        if let Some(snap) = &self.snapshot {
            write!(f, "@{}", snap)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for ResourcePath {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ResourcePath> for String {
    fn from(path: ResourcePath) -> Self {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_volume_and_snapshot_round_trip() {
        for input in ["ceph1/rbd/vol1", "ceph1/rbd/vol1@s1", "a/b/c@snap-2024.01"] {
            let path: ResourcePath = input.parse().unwrap();
            assert_eq!(path.to_string(), input);
        }
    }

    #[test]
    fn test_parse_components() {
        let path: ResourcePath = "ceph1/rbd/vol1@s1".parse().unwrap();
        assert_eq!(path.cluster(), "ceph1");
        assert_eq!(path.pool(), "rbd");
        assert_eq!(path.name(), "vol1");
        assert_eq!(path.snapshot_name(), Some("s1"));
        assert_eq!(path.pool_id().to_string(), "ceph1/rbd");
        assert_eq!(path.volume_path().to_string(), "ceph1/rbd/vol1");
        assert_eq!(path.image_spec(), "rbd/vol1@s1");
    }

    #[test]
    fn test_too_few_or_too_many_segments() {
        for input in ["", "ceph1", "ceph1/rbd", "ceph1/rbd/vol1/extra", "/rbd/vol1"] {
            assert_matches!(
                input.parse::<ResourcePath>(),
                Err(Error::Format { .. }),
                "input {:?}",
                input
            );
        }
    }

    #[test]
    fn test_empty_snapshot_qualifier_rejected() {
        assert_matches!(
            "ceph1/rbd/vol1@".parse::<ResourcePath>(),
            Err(Error::Format { .. })
        );
    }

    #[test]
    fn test_kind_specific_parsers() {
        assert!(ResourcePath::parse_volume("ceph1/rbd/vol1").is_ok());
        assert_matches!(
            ResourcePath::parse_volume("ceph1/rbd/vol1@s1"),
            Err(Error::Format { .. })
        );
        assert!(ResourcePath::parse_snapshot("ceph1/rbd/vol1@s1").is_ok());
        assert_matches!(
            ResourcePath::parse_snapshot("ceph1/rbd/vol1"),
            Err(Error::Format { .. })
        );
    }

    #[test]
    fn test_pool_id() {
        let id: PoolId = "ceph1/rbd".parse().unwrap();
        assert_eq!(id.cluster(), "ceph1");
        assert_eq!(id.pool(), "rbd");
        assert_eq!(id.to_string(), "ceph1/rbd");
        assert_eq!(id.volume("vol1").unwrap().to_string(), "ceph1/rbd/vol1");

        assert_matches!("ceph1".parse::<PoolId>(), Err(Error::Format { .. }));
        assert_matches!("ceph1/rbd/vol1".parse::<PoolId>(), Err(Error::Format { .. }));
        assert_matches!("ceph1/".parse::<PoolId>(), Err(Error::Format { .. }));
    }

    #[test]
    fn test_pool_id_rejects_separators() {
        assert_matches!(PoolId::new("ceph1", "a/b"), Err(Error::Format { .. }));
        assert_matches!(PoolId::new("ceph1", "rbd@x"), Err(Error::Format { .. }));
        assert_matches!(PoolId::new("ceph/1", "rbd"), Err(Error::Format { .. }));
    }

    #[test]
    fn test_surrounding_whitespace_rejected() {
        for input in [" ceph1/rbd/vol1", "ceph1/rbd/vol1 ", "ceph1/ rbd/vol1", "ceph1/rbd/vol1@ s1"] {
            assert_matches!(
                input.parse::<ResourcePath>(),
                Err(Error::Format { .. }),
                "input {:?}",
                input
            );
        }
        assert_matches!(" ceph1/rbd".parse::<PoolId>(), Err(Error::Format { .. }));
        assert_matches!(PoolId::new("ceph1", " rbd"), Err(Error::Format { .. }));

        // inner whitespace survives the round trip
        let path: ResourcePath = "ceph1/rbd/my vol".parse().unwrap();
        assert_eq!(path.to_string(), "ceph1/rbd/my vol");
    }

    #[test]
    fn test_serde_as_string() {
        let path: ResourcePath = "ceph1/rbd/vol1@s1".parse().unwrap();
        let json = serde_json::to_string(&path).unwrap();
        assert_eq!(json, "\"ceph1/rbd/vol1@s1\"");

        let back: ResourcePath = serde_json::from_str(&json).unwrap();
        assert_eq!(back, path);

        assert!(serde_json::from_str::<PoolId>("\"nope\"").is_err());
    }
}
