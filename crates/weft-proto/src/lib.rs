// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! weft-proto
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::Value as Json;
use thiserror::Error;

mod connection;
mod frame;
mod queue;

pub use connection::{CommandDispatcher, Connection};
pub use frame::{ClientFrame, ServerFrame};
pub use queue::OutboundQueue;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from the server connection.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// An inbound frame could not be parsed.
    #[error("frame error: {0}")]
    Frame(String),

    /// The pending request was dropped by a session reset.
    #[error("request abandoned")]
    Abandoned,

    /// The server answered a request with an error frame.
    #[error("server error: {0}")]
    Remote(Json),

    /// The server sent a command this agent does not know.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
}

// ---------------------------------------------------------------------------
// Disconnect
// ---------------------------------------------------------------------------

/// Classification of a socket's end of life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Closed or dropped without a recognised reason; reconnect after a
    /// delay, preserving the session.
    Dropped,
    /// The server rejected the session; clear local state and reconnect
    /// fresh.
    SessionInvalid,
    /// The project or environment does not exist; exit non-zero.
    Fatal(String),
}
