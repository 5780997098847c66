//! # rustla-core
//!
//! Presence tracking and stream routing for the rustla server.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Identity** - Resolve `(service, channel)` pairs and aliases into canonical streams
//! - **Store** - Query contract against the shared presence store
//! - **Registry** - Per-process map of live connections
//! - **Engine** - Connection lifecycle, stream assignment, count recomputation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Engine    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                       │    │    │
//!              ┌────────┘    │    └────────┐
//!              ▼             ▼             ▼
//!       ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//!       │  Identity   │ │    Store    │ │    Relay    │
//!       └─────────────┘ └─────────────┘ └─────────────┘
//! ```

pub mod engine;
pub mod identity;
pub mod registry;
pub mod store;

pub use engine::{EngineError, PresenceEngine};
pub use identity::{resolve, resolve_alias, AliasResolution, CanonicalStream, Rejection};
pub use registry::{ConnectionId, ConnectionRegistry, Outbox};
pub use store::{BannedStream, MemoryStore, PresenceStore, Rustler, StoreError, Stream, User};
