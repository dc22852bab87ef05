//! Connection lifecycle state machine with guarded transitions.

use thiserror::Error;

/// Lifecycle of one device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
    Error,
}

/// Raised when an edge is not part of the lifecycle graph.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid connection state transition: {from:?} -> {to:?}")]
pub struct StateError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    /// Validates and performs a transition.
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, StateError> {
        use ConnectionState::*;
        let allowed = matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Disconnected)
                | (Connected, Connecting)
                | (Connected, Expired)
                | (Connected, Error)
                | (Connected, Disconnected)
                | (Expired, Connecting)
                | (Expired, Error)
                | (Expired, Disconnected)
                | (Error, Connecting)
                | (Error, Disconnected)
        );
        if allowed || self == next {
            Ok(next)
        } else {
            Err(StateError {
                from: self,
                to: next,
            })
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}
