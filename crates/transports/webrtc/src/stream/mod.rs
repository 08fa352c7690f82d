//! Per-stream connection lifecycle
//!
//! [`machine::StreamMachine`] holds the state machine; [`connection::StreamConnection`]
//! drives it on a tokio task against a signaling channel and a media session.

pub mod connection;
pub mod machine;

pub use connection::{ConnectionDeps, StreamConnection, StreamSnapshot};
pub use machine::{StreamEffect, StreamMachine};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable identity of a camera stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamIdentity {
    /// Unique key, as known to the gateway
    pub key: String,
    /// Human readable label
    pub label: String,
}

impl StreamIdentity {
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
        }
    }
}

impl fmt::Display for StreamIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.key, self.label)
    }
}

/// Lifecycle state of one stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected; disabled, not yet enabled, or suspended
    #[default]
    Idle,
    /// Handshake in progress
    Connecting,
    /// Media flowing
    Connected,
    /// Waiting out a backoff delay before the next attempt
    Retrying,
    /// Attempts exhausted; waits for a manual reconnect
    Failed,
}

impl ConnectionState {
    /// Connecting or Retrying
    pub fn is_in_progress(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Retrying)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Retrying => "retrying",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
