//! Connection Events
//!
//! Events emitted by the connection registry for external consumers to react
//! to cluster session lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the connection registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A new session was established
    Connected { cluster: String },

    /// A cached session was handed out again
    Reused { cluster: String },

    /// A dead cached session was replaced
    Reconnected { cluster: String },

    /// Establishing a session failed; nothing was cached
    ConnectFailed { cluster: String, reason: String },

    /// A session was shut down during teardown
    Closed { cluster: String },
}

impl ConnectionEvent {
    /// Get the cluster associated with this event
    pub fn cluster(&self) -> &str {
        match self {
            ConnectionEvent::Connected { cluster } => cluster,
            ConnectionEvent::Reused { cluster } => cluster,
            ConnectionEvent::Reconnected { cluster } => cluster,
            ConnectionEvent::ConnectFailed { cluster, .. } => cluster,
            ConnectionEvent::Closed { cluster } => cluster,
        }
    }

    /// Check if this event produced a new session
    pub fn is_new_session(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Connected { .. } | ConnectionEvent::Reconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_cluster() {
        let event = ConnectionEvent::ConnectFailed {
            cluster: "ceph1".to_string(),
            reason: "no config".to_string(),
        };
        assert_eq!(event.cluster(), "ceph1");
        assert!(!event.is_new_session());

        let event = ConnectionEvent::Reconnected {
            cluster: "ceph2".to_string(),
        };
        assert!(event.is_new_session());
    }
}
