//! Reconciler configuration
//!
//! Loaded from an optional YAML file; command-line flags override individual
//! values afterwards.

use crate::backends::{BackendKind, RbdCliConfig};
use crate::error::{Error, Result};
use crate::registry::split_clusters;
use crate::sync::WaitPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cluster identifier
pub const DEFAULT_CLUSTER: &str = "ceph";

/// Polling schedule of the opt-in wait-for-success helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            timeout_secs: 300,
        }
    }
}

impl WaitConfig {
    pub fn policy(&self) -> WaitPolicy {
        WaitPolicy::new(
            Duration::from_secs(self.interval_secs),
            Duration::from_secs(self.timeout_secs),
        )
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Comma-separated cluster identifiers to connect up front
    pub cluster: String,
    pub backend: BackendKind,
    /// `conf_dir`, `ceph_bin`, `rbd_bin`, `connect_timeout_secs`
    #[serde(flatten)]
    pub rbd_cli: RbdCliConfig,
    pub wait: WaitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: DEFAULT_CLUSTER.to_string(),
            backend: BackendKind::default(),
            rbd_cli: RbdCliConfig::default(),
            wait: WaitConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.clusters().is_empty() {
            return Err(Error::Configuration("no cluster configured".to_string()));
        }
        if self.wait.interval_secs == 0 {
            return Err(Error::Configuration(
                "wait.interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.wait.timeout_secs < self.wait.interval_secs {
            return Err(Error::Configuration(format!(
                "wait.timeout_secs ({}) is shorter than wait.interval_secs ({})",
                self.wait.timeout_secs, self.wait.interval_secs
            )));
        }
        Ok(())
    }

    /// Configured cluster identifiers
    pub fn clusters(&self) -> Vec<String> {
        split_clusters(&self.cluster)
    }

    pub fn wait_policy(&self) -> WaitPolicy {
        self.wait.policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.clusters(), vec!["ceph"]);
        assert_eq!(config.backend, BackendKind::RbdCli);
        assert_eq!(config.rbd_cli.conf_dir, PathBuf::from("/etc/ceph"));
        assert_eq!(config.wait_policy(), WaitPolicy::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cluster: ceph1, ceph2\nbackend: memory\nconf_dir: /opt/ceph\nwait:\n  interval_secs: 2\n  timeout_secs: 10\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.clusters(), vec!["ceph1", "ceph2"]);
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.rbd_cli.conf_dir, PathBuf::from("/opt/ceph"));
        assert_eq!(config.rbd_cli.rbd_bin, "rbd");
        assert_eq!(config.wait_policy().interval, Duration::from_secs(2));
        assert_eq!(config.wait_policy().timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(Config::from_yaml("cluster: ' , '"), Err(Error::Configuration(_)));
        assert_matches!(
            Config::from_yaml("wait:\n  interval_secs: 0\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(
            Config::from_yaml("wait:\n  interval_secs: 10\n  timeout_secs: 5\n"),
            Err(Error::Configuration(_))
        );
        assert_matches!(Config::from_yaml("backend: tape\n"), Err(Error::YamlParse(_)));
        assert_matches!(Config::load("/nonexistent/ceph-reconciler.yaml"), Err(Error::Io(_)));
    }
}
