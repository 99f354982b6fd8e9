//! Pool reconciliation
//!
//! Pools carry no tracked attributes beyond existence.

use super::{Observed, Outcome, Reconciler};
use crate::domain::path::PoolId;
use crate::domain::ports::ResourceKind;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Desired pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub cluster: String,
    pub name: String,
}

impl PoolSpec {
    pub fn new(cluster: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> Result<PoolId> {
        PoolId::new(self.cluster.trim(), self.name.trim())
    }
}

/// Observed pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolState {
    pub id: PoolId,
    pub cluster: String,
    pub name: String,
}

impl Reconciler {
    /// Ensure the pool exists. Returns its identifier.
    pub async fn create_pool(&self, spec: &PoolSpec) -> Result<PoolId> {
        let result = self.create_pool_inner(spec).await;
        self.track(ResourceKind::Pool, "create", result)
    }

    async fn create_pool_inner(&self, spec: &PoolSpec) -> Result<(PoolId, Outcome)> {
        let id = spec.id()?;
        debug!("create pool '{}'", id);
        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Pool, &id.to_string()).await;

        if session.client().pool_exists(id.pool()).await? {
            info!("pool '{}' already exists", id);
            return Ok((id, Outcome::Unchanged));
        }

        session.client().create_pool(id.pool()).await?;
        info!("created pool '{}'", id);
        Ok((id, Outcome::Changed))
    }

    /// Check whether the pool still exists
    pub async fn read_pool(&self, id: &PoolId) -> Result<Observed<PoolState>> {
        let result = self.read_pool_inner(id).await;
        self.track(ResourceKind::Pool, "read", result)
    }

    async fn read_pool_inner(&self, id: &PoolId) -> Result<(Observed<PoolState>, Outcome)> {
        debug!("read pool '{}'", id);
        let session = self.session(id.cluster()).await?;

        if !session.client().pool_exists(id.pool()).await? {
            warn!("pool '{}' may have been deleted out of band", id);
            return Ok((Observed::Gone, Outcome::Gone));
        }

        let state = PoolState {
            id: id.clone(),
            cluster: id.cluster().to_string(),
            name: id.pool().to_string(),
        };
        Ok((Observed::Present(state), Outcome::Unchanged))
    }

    /// Delete the pool. Permission denied is tolerated and logged.
    pub async fn delete_pool(&self, id: &PoolId) -> Result<()> {
        let result = self.delete_pool_inner(id).await;
        self.track(ResourceKind::Pool, "delete", result)
    }

    async fn delete_pool_inner(&self, id: &PoolId) -> Result<((), Outcome)> {
        debug!("delete pool '{}'", id);
        let session = self.session(id.cluster()).await?;
        let _guard = self.lock(&session, ResourceKind::Pool, &id.to_string()).await;

        match session.client().delete_pool(id.pool()).await {
            Ok(()) => {
                info!("deleted pool '{}'", id);
                Ok(((), Outcome::Changed))
            }
            Err(Error::PermissionDenied { .. }) => {
                warn!("no permission to delete pool '{}', leaving it in place", id);
                Ok(((), Outcome::Unchanged))
            }
            Err(e) => Err(e),
        }
    }
}
