//! # rustla-relay
//!
//! Cross-process relay for the rustla presence server.
//!
//! A deployment can run several server processes that share one store but
//! hold their own sockets. When a process changes something every viewer
//! should see, it publishes a [`RelayCommand`] and every other process runs
//! the same local operation against its own connections.
//!
//! - **NoopRelay** - single-process deployments
//! - **LocalHub** - several engines inside one process
//! - **Coordinator / WorkerRelay** - TCP fan-out between processes
//!
//! ```rust,ignore
//! use rustla_relay::{Relay, WorkerRelay};
//!
//! let (relay, mut inbox) = WorkerRelay::connect("127.0.0.1:7400", "worker-1").await?;
//! relay.publish(RelayCommand::UpdateLobby).await?;
//! while let Some(command) = inbox.recv().await {
//!     // run the command locally
//! }
//! ```

pub mod local;
pub mod tcp;
pub mod traits;

pub use local::{LocalHub, LocalRelay};
pub use rustla_protocol::RelayCommand;
pub use tcp::{Coordinator, WorkerRelay};
pub use traits::{NodeId, NoopRelay, Relay, RelayError, RelayInbox};
