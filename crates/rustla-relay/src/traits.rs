//! Relay abstraction traits.
//!
//! The presence engine only sees the [`Relay`] trait, so a single-process
//! server and a multi-process deployment run the same engine code.

use async_trait::async_trait;
use rustla_protocol::RelayCommand;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Commands received from other processes, in arrival order.
pub type RelayInbox = mpsc::UnboundedReceiver<RelayCommand>;

/// Name of a process taking part in the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new node ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random node ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("node_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Relay errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The link to the other processes is gone.
    #[error("Relay closed")]
    Closed,

    /// Handshake with the coordinator failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] rustla_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One-way, best-effort fan-out of broadcast-class commands.
///
/// Delivery is at most once and never retried. Callers log failures and move
/// on; the next command carries a fresh snapshot anyway.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Ask every other process to run `command` locally.
    async fn publish(&self, command: RelayCommand) -> Result<(), RelayError>;

    /// Get the relay name (e.g., "noop", "local", "tcp").
    fn name(&self) -> &'static str;
}

/// Relay for a server that runs as a single process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRelay;

#[async_trait]
impl Relay for NoopRelay {
    async fn publish(&self, _command: RelayCommand) -> Result<(), RelayError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
