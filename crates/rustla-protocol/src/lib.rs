//! # rustla-protocol
//!
//! Wire protocol definitions for the rustla presence server.
//!
//! Two protocols live here:
//!
//! - **Client protocol** - JSON arrays exchanged with viewers over WebSocket,
//!   `[event, ...args]` in both directions.
//! - **Relay protocol** - length-prefixed MessagePack frames exchanged between
//!   cooperating server processes.
//!
//! ## Example
//!
//! ```rust
//! use rustla_protocol::{codec, ClientEvent, ServerEvent, StreamId};
//!
//! let event = codec::decode_client(r#"["setStream", "destiny", "twitch"]"#).unwrap();
//! assert_eq!(
//!     event,
//!     Some(ClientEvent::SetStream {
//!         channel: Some("destiny".into()),
//!         service: Some("twitch".into()),
//!     })
//! );
//!
//! let reply = ServerEvent::RustlersSet { stream_id: StreamId::new(7), rustlers: 2 };
//! assert_eq!(codec::encode_server(&reply).unwrap(), r#"["RUSTLERS_SET",7,2]"#);
//! ```

pub mod codec;
pub mod events;
pub mod relay;

pub use codec::{decode_client, encode_server, ProtocolError};
pub use events::{ClientEvent, ServerEvent, StreamId, StreamView};
pub use relay::{RelayCommand, RelayFrame};
