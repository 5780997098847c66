//! Query contract against the presence store.
//!
//! The store is the only state shared between server processes. Every
//! aggregate the engine broadcasts is re-read from here rather than cached,
//! so concurrent updates from several processes converge.

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use rustla_protocol::{StreamId, StreamView};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::ConnectionId;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt {
        /// Key of the offending record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },

    /// Redis error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Presence record of one live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rustler {
    /// Connection identity.
    pub id: ConnectionId,
    /// Stream being watched, `None` while in the lobby.
    pub stream_id: Option<StreamId>,
}

impl Rustler {
    /// Check if this rustler is in the lobby.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.stream_id.is_none()
    }
}

/// A canonical stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Identity derived from `service/channel`.
    pub id: StreamId,
    /// Streaming service.
    pub service: String,
    /// Normalized channel.
    pub channel: String,
    /// Alias this stream was first reached through.
    pub overrustle_id: Option<String>,
}

impl Stream {
    /// Render this stream for viewers with its current watcher count.
    #[must_use]
    pub fn view(&self, rustlers: u64) -> StreamView {
        StreamView {
            id: self.id,
            service: self.service.clone(),
            channel: self.channel.clone(),
            overrustle_id: self.overrustle_id.clone(),
            rustlers,
        }
    }
}

/// An account that can be used as a stream alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Account name; doubles as the alias.
    pub name: String,
    /// Default service, if configured.
    pub service: Option<String>,
    /// Default channel, if configured.
    pub channel: Option<String>,
}

/// A denylisted canonical `(service, channel)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BannedStream {
    /// Streaming service.
    pub service: String,
    /// Normalized channel.
    pub channel: String,
}

impl BannedStream {
    /// Create a new ban entry.
    #[must_use]
    pub fn new(service: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            channel: channel.into(),
        }
    }
}

/// The store query contract.
///
/// Implementations must make `find_or_create_stream` idempotent on the stream
/// id: two callers racing to create the same stream both succeed and observe
/// one record.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Persist a new rustler in the lobby.
    async fn create_rustler(&self, id: &ConnectionId) -> Result<(), StoreError>;

    /// Look up a rustler.
    async fn find_rustler(&self, id: &ConnectionId) -> Result<Option<Rustler>, StoreError>;

    /// Point a rustler at a stream, or at the lobby with `None`.
    ///
    /// Returns `false` if the rustler does not exist.
    async fn set_rustler_stream(
        &self,
        id: &ConnectionId,
        stream_id: Option<StreamId>,
    ) -> Result<bool, StoreError>;

    /// Delete a rustler. Deleting a missing rustler is not an error.
    async fn destroy_rustler(&self, id: &ConnectionId) -> Result<(), StoreError>;

    /// Find rustlers watching `stream_id` or sitting in the lobby.
    async fn find_rustlers_watching_or_idle(
        &self,
        stream_id: StreamId,
    ) -> Result<Vec<Rustler>, StoreError>;

    /// Count rustlers watching `stream_id`.
    async fn count_rustlers(&self, stream_id: StreamId) -> Result<u64, StoreError>;

    /// Look up a stream.
    async fn find_stream(&self, id: StreamId) -> Result<Option<Stream>, StoreError>;

    /// Look up the stream linked to a user alias.
    async fn find_stream_by_alias(&self, alias: &str) -> Result<Option<Stream>, StoreError>;

    /// Return the stream with `stream.id`, creating it from `stream` if absent.
    ///
    /// The flag is `true` if this call created the record.
    async fn find_or_create_stream(&self, stream: Stream) -> Result<(Stream, bool), StoreError>;

    /// Delete a stream and its alias link if nobody watches it.
    ///
    /// The watcher check and the delete are one atomic step. Returns `true`
    /// if the stream was deleted.
    async fn destroy_empty_stream(&self, id: StreamId) -> Result<bool, StoreError>;

    /// List streams that have watchers, busiest first.
    async fn streams_with_rustlers(&self) -> Result<Vec<(Stream, u64)>, StoreError>;

    /// Check if a canonical pair is denylisted.
    async fn is_banned(&self, service: &str, channel: &str) -> Result<bool, StoreError>;

    /// Look up a user by name.
    async fn find_user(&self, name: &str) -> Result<Option<User>, StoreError>;
}

/// Order a lobby listing: most watchers first, ties by id.
pub(crate) fn sort_listing(listing: &mut [(Stream, u64)]) {
    listing.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then(a.id.cmp(&b.id)));
}
