//! Cluster Connection Registry
//!
//! Process-wide cache of cluster sessions. A session is created on first
//! reference and reused by every resource operation against that cluster
//! until `teardown_all` runs at shutdown.
//!
//! Each cluster has its own slot, and the check-connect-insert sequence runs
//! under that slot's mutex: a cluster never has more than one session even
//! when several tasks resolve it for the first time concurrently, while a
//! slow connect only holds up callers of the same cluster. Slot mutexes are
//! independent of the per-resource keyed locks carried by each session.

use super::ConnectionEvent;
use crate::domain::ports::{ClusterConnector, StorageCluster};
use crate::error::{Error, Result};
use crate::sync::{KeyedGuard, KeyedLocks};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

// =============================================================================
// Cluster Session
// =============================================================================

/// A live connection to one cluster plus the lock set scoped to it
pub struct ClusterSession {
    cluster: String,
    client: Arc<dyn StorageCluster>,
    locks: Arc<KeyedLocks>,
    connected_at: DateTime<Utc>,
}

impl std::fmt::Debug for ClusterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSession")
            .field("cluster", &self.cluster)
            .field("connected_at", &self.connected_at)
            .field("lock_keys", &self.locks.len())
            .finish()
    }
}

impl ClusterSession {
    fn new(cluster: &str, client: Arc<dyn StorageCluster>, locks: Arc<KeyedLocks>) -> Self {
        Self {
            cluster: cluster.to_string(),
            client,
            locks,
            connected_at: Utc::now(),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Backend client for this cluster
    pub fn client(&self) -> &dyn StorageCluster {
        self.client.as_ref()
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Acquire a resource key in this cluster's lock set
    pub async fn lock(&self, key: impl Into<String>) -> KeyedGuard {
        self.locks.acquire(key).await
    }
}

// =============================================================================
// Connection Registry
// =============================================================================

/// Session of one cluster, empty until connected
type Slot = Arc<Mutex<Option<Arc<ClusterSession>>>>;

/// Maps cluster identifiers to live sessions
pub struct ConnectionRegistry {
    connector: Arc<dyn ClusterConnector>,
    slots: DashMap<String, Slot>,
    event_sender: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionRegistry {
    /// Create a new registry backed by `connector`
    pub fn new(connector: Arc<dyn ClusterConnector>) -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(256);

        Arc::new(Self {
            connector,
            slots: DashMap::new(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    fn slot(&self, cluster: &str) -> Slot {
        self.slots.entry(cluster.to_string()).or_default().value().clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Return the live session for `cluster`, connecting if needed
    pub async fn resolve(&self, cluster: &str) -> Result<Arc<ClusterSession>> {
        let slot = self.slot(cluster);
        let mut current = slot.lock().await;

        let previous_locks = match current.as_ref() {
            Some(session) if session.client.is_connected() => {
                debug!("reusing connection for ceph cluster: '{}'", cluster);
                let _ = self.event_sender.send(ConnectionEvent::Reused {
                    cluster: cluster.to_string(),
                });
                return Ok(session.clone());
            }
            Some(session) => {
                warn!("connection for ceph cluster '{}' is no longer live", cluster);
                Some(session.locks.clone())
            }
            None => None,
        };

        let client = match self.connector.connect(cluster).await {
            Ok(client) => client,
            Err(e) => {
                let _ = self.event_sender.send(ConnectionEvent::ConnectFailed {
                    cluster: cluster.to_string(),
                    reason: e.to_string(),
                });
                if matches!(e, Error::Connection { .. }) {
                    return Err(e);
                }
                return Err(Error::Connection {
                    cluster: cluster.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let reconnected = previous_locks.is_some();
        let locks = previous_locks.unwrap_or_default();
        let session = Arc::new(ClusterSession::new(cluster, client, locks));
        *current = Some(session.clone());

        let event = if reconnected {
            ConnectionEvent::Reconnected {
                cluster: cluster.to_string(),
            }
        } else {
            ConnectionEvent::Connected {
                cluster: cluster.to_string(),
            }
        };
        let _ = self.event_sender.send(event);

        info!("created connection for ceph cluster: {}", cluster);
        Ok(session)
    }

    /// Resolve every cluster in a comma-separated list
    pub async fn resolve_all(&self, clusters: &str) -> Result<Vec<Arc<ClusterSession>>> {
        let mut resolved = Vec::new();
        for cluster in split_clusters(clusters) {
            resolved.push(self.resolve(&cluster).await?);
        }
        Ok(resolved)
    }

    /// Cached session for `cluster` without connecting
    pub async fn cached(&self, cluster: &str) -> Option<Arc<ClusterSession>> {
        let slot = self.slots.get(cluster).map(|entry| entry.value().clone())?;
        let session = slot.lock().await.clone();
        session
    }

    /// Number of cached sessions
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for slot in self.all_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Shut down every cached session. Failures are logged and do not stop
    /// the remaining sessions from closing. Returns the number of sessions
    /// that were dropped from the registry.
    pub async fn teardown_all(&self) -> usize {
        let mut drained = Vec::new();
        for slot in self.all_slots() {
            if let Some(session) = slot.lock().await.take() {
                drained.push(session);
            }
        }

        let count = drained.len();
        let closing = drained.into_iter().map(|session| async move {
            let cluster = session.cluster.clone();
            debug!("cleaning up connection for ceph cluster: {}", cluster);
            if let Err(e) = session.client.shutdown().await {
                warn!("failed to close connection for ceph cluster '{}': {}", cluster, e);
            }
            cluster
        });

        for cluster in futures::future::join_all(closing).await {
            let _ = self.event_sender.send(ConnectionEvent::Closed { cluster });
        }
        count
    }
}

/// Split a comma-separated cluster list, trimming blanks
pub fn split_clusters(clusters: &str) -> Vec<String> {
    clusters
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryConnector;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn test_split_clusters() {
        assert_eq!(split_clusters("ceph1, ceph2,,ceph3 "), vec!["ceph1", "ceph2", "ceph3"]);
        assert!(split_clusters(" , ").is_empty());
    }

    #[tokio::test]
    async fn test_resolve_creates_once_then_reuses() {
        let connector = MemoryConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let mut events = registry.subscribe();

        let first = registry.resolve("ceph1").await.unwrap();
        let second = registry.resolve("ceph1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connect_count("ceph1"), 1);
        assert_eq!(registry.len().await, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { cluster: "ceph1".into() }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectionEvent::Reused { cluster: "ceph1".into() }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_resolve_connects_once() {
        let connector = MemoryConnector::new();
        connector.set_connect_delay(Duration::from_millis(20));
        let registry = ConnectionRegistry::new(connector.clone());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("ceph1").await })
            })
            .collect();

        let sessions: Vec<_> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        assert_eq!(connector.connect_count("ceph1"), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
    }

    #[tokio::test]
    async fn test_cached_cluster_not_held_up_by_slow_connect() {
        let connector = MemoryConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());
        let ceph1 = registry.resolve("ceph1").await.unwrap();

        connector.set_connect_delay(Duration::from_millis(500));
        let slow = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve("ceph2").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!slow.is_finished());

        let again = tokio::time::timeout(Duration::from_millis(100), registry.resolve("ceph1"))
            .await
            .expect("cached cluster must resolve while another connects")
            .unwrap();
        assert!(Arc::ptr_eq(&ceph1, &again));

        assert!(slow.await.unwrap().is_ok());
        assert_eq!(connector.connect_count("ceph2"), 1);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let connector = MemoryConnector::new();
        connector.fail_connect("ceph1", true);
        let registry = ConnectionRegistry::new(connector.clone());

        let err = registry.resolve("ceph1").await.unwrap_err();
        assert_matches!(err, Error::Connection { ref cluster, .. } if cluster == "ceph1");
        assert!(registry.cached("ceph1").await.is_none());

        connector.fail_connect("ceph1", false);
        assert!(registry.resolve("ceph1").await.is_ok());
        assert_eq!(connector.connect_count("ceph1"), 1);
    }

    #[tokio::test]
    async fn test_dead_session_is_replaced_and_keeps_locks() {
        let connector = MemoryConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());

        let first = registry.resolve("ceph1").await.unwrap();
        let held = first.lock("vol1").await;
        first.client().shutdown().await.unwrap();

        let second = registry.resolve("ceph1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.connect_count("ceph1"), 2);
        assert!(second.locks().is_locked("vol1"));

        held.release();
        assert!(!second.locks().is_locked("vol1"));
    }

    #[tokio::test]
    async fn test_resolve_all_and_teardown() {
        let connector = MemoryConnector::new();
        let registry = ConnectionRegistry::new(connector.clone());

        let sessions = registry.resolve_all("ceph1,ceph2").await.unwrap();
        assert_eq!(sessions.len(), 2);

        // overlapping list reuses the cached sessions
        registry.resolve_all("ceph2, ceph1").await.unwrap();
        assert_eq!(connector.connect_count("ceph1"), 1);
        assert_eq!(connector.connect_count("ceph2"), 1);

        let mut events = registry.subscribe();
        assert_eq!(registry.teardown_all().await, 2);
        assert!(registry.is_empty().await);
        assert!(!sessions[0].client().is_connected());
        assert!(!sessions[1].client().is_connected());

        let mut closed = vec![
            events.recv().await.unwrap().cluster().to_string(),
            events.recv().await.unwrap().cluster().to_string(),
        ];
        closed.sort();
        assert_eq!(closed, vec!["ceph1", "ceph2"]);
    }
}
