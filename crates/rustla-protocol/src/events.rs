//! Client and server event types.
//!
//! Every message on the viewer socket is a JSON array whose first element is
//! the event name. Inbound events are requests from a viewer; outbound events
//! are snapshots pushed by the server.

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Canonical identity of a stream.
///
/// Derived from the normalized `service/channel` pair, so every process
/// computes the same id for the same stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(u32);

impl StreamId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

impl From<u32> for StreamId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A stream as shown to viewers, with its live watcher count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamView {
    /// Stream identity.
    pub id: StreamId,
    /// Streaming service (e.g. `twitch`, `advanced`).
    pub service: String,
    /// Channel on the service, or the normalized URL for `advanced`.
    pub channel: String,
    /// Alias of the user this stream was reached through, if any.
    pub overrustle_id: Option<String>,
    /// Number of rustlers currently watching.
    pub rustlers: u64,
}

/// A request from a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Look up a stream and its watcher count.
    GetStream {
        /// Stream to look up.
        stream_id: StreamId,
    },

    /// Change the stream being watched.
    ///
    /// Both fields absent moves the viewer to the lobby. A channel without a
    /// service is treated as a user alias.
    SetStream {
        /// Channel name, URL, or alias.
        channel: Option<String>,
        /// Streaming service.
        service: Option<String>,
    },
}

impl ClientEvent {
    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::GetStream { .. } => "getStream",
            ClientEvent::SetStream { .. } => "setStream",
        }
    }
}

/// An event pushed to a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Result of a `setStream` request. `None` means the viewer is in the lobby.
    StreamSet(Option<StreamView>),
    /// Result of a `getStream` request. `None` means no such stream.
    StreamGet(Option<StreamView>),
    /// Full lobby listing.
    StreamsSet(Vec<StreamView>),
    /// Current watcher count of one stream.
    RustlersSet {
        /// Stream whose count changed.
        stream_id: StreamId,
        /// Current watcher count.
        rustlers: u64,
    },
}

impl ServerEvent {
    /// Event name for `setStream` replies.
    pub const STREAM_SET: &'static str = "STREAM_SET";
    /// Event name for `getStream` replies.
    pub const STREAM_GET: &'static str = "STREAM_GET";
    /// Event name for lobby listings.
    pub const STREAMS_SET: &'static str = "STREAMS_SET";
    /// Event name for count updates.
    pub const RUSTLERS_SET: &'static str = "RUSTLERS_SET";

    /// Get the wire name of this event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::StreamSet(_) => Self::STREAM_SET,
            ServerEvent::StreamGet(_) => Self::STREAM_GET,
            ServerEvent::StreamsSet(_) => Self::STREAMS_SET,
            ServerEvent::RustlersSet { .. } => Self::RUSTLERS_SET,
        }
    }
}

impl Serialize for ServerEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServerEvent::StreamSet(stream) | ServerEvent::StreamGet(stream) => {
                (self.name(), stream).serialize(serializer)
            }
            ServerEvent::StreamsSet(streams) => (self.name(), streams).serialize(serializer),
            ServerEvent::RustlersSet {
                stream_id,
                rustlers,
            } => (self.name(), stream_id, rustlers).serialize(serializer),
        }
    }
}
