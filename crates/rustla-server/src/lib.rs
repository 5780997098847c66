//! # rustla-server
//!
//! WebSocket front end for the rustla presence engine.
//!
//! A process runs in one of three roles:
//!
//! - **standalone** - serves viewers, no relay
//! - **worker** - serves viewers and joins a coordinator's relay
//! - **coordinator** - relays commands between workers, serves no viewers

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::{Config, ConfigError, Role, StoreBackend};
pub use handlers::{router, run_server, serve, AppState};
