//! Storage Backend Adapters
//!
//! Provides adapters implementing the cluster ports:
//! - rbd-cli: the stock `ceph`/`rbd` command-line tools
//! - memory: an in-process fake cluster

pub mod command;
pub mod memory;
pub mod rbd_cli;

pub use memory::{MemoryClusterState, MemoryConnector, Mutation};
pub use rbd_cli::{RbdCliConfig, RbdCliConnector};

use crate::domain::ports::ClusterConnector;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Available backend adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    RbdCli,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::RbdCli => f.write_str("rbd-cli"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "rbd-cli" | "rbd" | "cli" => Ok(BackendKind::RbdCli),
            "memory" | "mem" => Ok(BackendKind::Memory),
            _ => Err(Error::Configuration(format!("unknown backend '{}'", s))),
        }
    }
}

/// Factory for creating cluster connectors
pub struct BackendFactory;

impl BackendFactory {
    /// Create the connector for `kind`
    pub fn connector(kind: BackendKind, config: &RbdCliConfig) -> Arc<dyn ClusterConnector> {
        match kind {
            BackendKind::RbdCli => Arc::new(RbdCliConnector::new(config.clone())),
            BackendKind::Memory => MemoryConnector::new(),
        }
    }

    /// Create a connector by name
    pub fn create(name: &str, config: &RbdCliConfig) -> Result<Arc<dyn ClusterConnector>> {
        Ok(Self::connector(name.parse()?, config))
    }
}
