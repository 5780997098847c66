//! Frames exchanged between cooperating server processes.

use serde::{Deserialize, Serialize};

use crate::events::StreamId;

/// A broadcast-class operation one process asks the others to run locally.
///
/// Both commands carry no state: the receiver re-reads the current snapshot
/// from the shared store, so a lost command is repaired by the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "camelCase")]
pub enum RelayCommand {
    /// Recompute and push the watcher count of a stream.
    UpdateRustlers(StreamId),
    /// Push the lobby listing to every connection.
    UpdateLobby,
}

impl RelayCommand {
    /// Get the wire name of this command.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            RelayCommand::UpdateRustlers(_) => "updateRustlers",
            RelayCommand::UpdateLobby => "updateLobby",
        }
    }
}

/// A relay protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    /// First frame a worker sends after connecting.
    #[serde(rename = "hello")]
    Hello {
        /// Worker node name, for logs.
        node: String,
    },

    /// Coordinator reply once the worker is registered for fan-out.
    #[serde(rename = "welcome")]
    Welcome,

    /// A command to run on every other node.
    #[serde(rename = "command")]
    Command {
        /// Node that published the command.
        origin: String,
        /// The command itself.
        command: RelayCommand,
    },
}

impl RelayFrame {
    /// Create a new Hello frame.
    #[must_use]
    pub fn hello(node: impl Into<String>) -> Self {
        RelayFrame::Hello { node: node.into() }
    }

    /// Create a new Command frame.
    #[must_use]
    pub fn command(origin: impl Into<String>, command: RelayCommand) -> Self {
        RelayFrame::Command {
            origin: origin.into(),
            command,
        }
    }
}
