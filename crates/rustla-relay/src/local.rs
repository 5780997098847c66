//! In-process relay hub.
//!
//! Connects several presence engines living in the same process. Each member
//! receives every command published by the others, never its own.

use async_trait::async_trait;
use rustla_protocol::RelayCommand;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::traits::{NodeId, Relay, RelayError, RelayInbox};

/// Default broadcast capacity.
const DEFAULT_HUB_CAPACITY: usize = 1024;

/// A shared fan-out point for [`LocalRelay`] members.
#[derive(Debug, Clone)]
pub struct LocalHub {
    sender: broadcast::Sender<Arc<(NodeId, RelayCommand)>>,
}

impl LocalHub {
    /// Create a new hub.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HUB_CAPACITY)
    }

    /// Create a new hub with a specific capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Join the hub as `node`.
    ///
    /// Must be called inside a tokio runtime: a forwarding task moves
    /// commands from the hub into the returned inbox.
    pub fn join(&self, node: impl Into<NodeId>) -> (LocalRelay, RelayInbox) {
        let node = node.into();
        let mut rx = self.sender.subscribe();
        let (tx, inbox) = mpsc::unbounded_channel();

        let me = node.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(entry) => {
                        let (origin, command) = entry.as_ref();
                        if *origin == me {
                            continue;
                        }
                        if tx.send(*command).is_err() {
                            break; // Inbox dropped
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(node = %me, skipped, "Local relay lagged");
                        continue;
                    }
                }
            }
        });

        debug!(node = %node, "Joined local relay hub");

        let relay = LocalRelay {
            node,
            sender: self.sender.clone(),
        };
        (relay, inbox)
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A member of a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalRelay {
    node: NodeId,
    sender: broadcast::Sender<Arc<(NodeId, RelayCommand)>>,
}

impl LocalRelay {
    /// Get this member's node ID.
    #[must_use]
    pub fn node(&self) -> &NodeId {
        &self.node
    }
}

#[async_trait]
impl Relay for LocalRelay {
    async fn publish(&self, command: RelayCommand) -> Result<(), RelayError> {
        // No receivers just means nobody else joined yet.
        let _ = self.sender.send(Arc::new((self.node.clone(), command)));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustla_protocol::StreamId;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_hub_skips_origin() {
        let hub = LocalHub::new();
        let (relay_a, mut inbox_a) = hub.join("a");
        let (_relay_b, mut inbox_b) = hub.join("b");

        relay_a
            .publish(RelayCommand::UpdateRustlers(StreamId::new(4)))
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), inbox_b.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(RelayCommand::UpdateRustlers(StreamId::new(4))));

        // The publisher does not hear its own command.
        assert!(timeout(Duration::from_millis(50), inbox_a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_hub_fans_out_to_all_members() {
        let hub = LocalHub::new();
        let (relay_a, _inbox_a) = hub.join("a");
        let (_relay_b, mut inbox_b) = hub.join("b");
        let (_relay_c, mut inbox_c) = hub.join("c");

        relay_a.publish(RelayCommand::UpdateLobby).await.unwrap();

        for inbox in [&mut inbox_b, &mut inbox_c] {
            let received = timeout(Duration::from_secs(1), inbox.recv()).await.unwrap();
            assert_eq!(received, Some(RelayCommand::UpdateLobby));
        }
    }

    #[tokio::test]
    async fn test_publish_without_members() {
        let hub = LocalHub::new();
        let (relay, inbox) = hub.join("alone");
        drop(inbox);
        assert!(relay.publish(RelayCommand::UpdateLobby).await.is_ok());
        assert_eq!(relay.node().as_str(), "alone");
    }
}
