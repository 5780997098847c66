//! Per-process registry of live connections.
//!
//! Maps connection ids to their outbound queues. The registry only knows about
//! connections held by this process; connections on other processes are
//! reached through the relay.

use dashmap::DashMap;
use rustla_protocol::ServerEvent;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Outbound queue of one connection.
pub type Outbox = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// A globally unique connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Allocate a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The connection registry.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Outbox>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbox, replacing any previous one.
    pub fn register(&self, id: ConnectionId, outbox: Outbox) {
        debug!(connection = %id, "Registered connection");
        self.connections.insert(id, outbox);
    }

    /// Remove a connection. Returns `true` if it was registered.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.remove(id).is_some();
        if removed {
            debug!(connection = %id, "Unregistered connection");
        }
        removed
    }

    /// Check if a connection is registered.
    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Push an event to one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is closed.
    pub fn send(&self, id: &ConnectionId, event: ServerEvent) -> bool {
        self.send_shared(id, Arc::new(event))
    }

    /// Push a shared event to one connection.
    pub fn send_shared(&self, id: &ConnectionId, event: Arc<ServerEvent>) -> bool {
        match self.connections.get(id) {
            Some(outbox) => {
                let delivered = outbox.send(event).is_ok();
                if !delivered {
                    trace!(connection = %id, "Outbox closed");
                }
                delivered
            }
            None => false,
        }
    }

    /// Push an event to every connection. Returns the number delivered.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let event = Arc::new(event);
        let delivered = self
            .connections
            .iter()
            .filter(|entry| entry.value().send(Arc::clone(&event)).is_ok())
            .count();

        trace!(event = event.name(), recipients = delivered, "Broadcast");
        delivered
    }

    /// Snapshot of registered connection ids.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Remove every connection and return their ids.
    pub fn drain(&self) -> Vec<ConnectionId> {
        let ids = self.connection_ids();
        for id in &ids {
            self.connections.remove(id);
        }
        debug!(count = ids.len(), "Drained registry");
        ids
    }
}
