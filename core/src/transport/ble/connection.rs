/// Connection state shared by both session roles
///
/// Disconnected --connect/accept--> Connecting --success--> Connected
/// --failure or peer gone--> Disconnected. A failed attempt goes straight back to
/// Disconnected; there is no reconnecting state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Link state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Link requested, outcome pending
    Connecting,
    /// Link established and usable
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// Tracks the current state and reports whether an update actually changed it
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionTracker {
    state: ConnectionState,
}

impl ConnectionTracker {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Move to `next`; returns the new state when it differs from the old one
    pub fn transition(&mut self, next: ConnectionState) -> Option<ConnectionState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}
