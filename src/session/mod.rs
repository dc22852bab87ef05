//! Session lifecycle management: expiry horizon, anticipatory refresh with
//! a single in-flight attempt, and session-error classification.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::TapoError;

pub mod state;

pub use state::{ConnectionState, StateError};

const REFRESH_ATTEMPTS: u32 = 3;
const REFRESH_BACKOFF_BASE: Duration = Duration::from_secs(1);

const SESSION_ERROR_PATTERNS: &[&str] = &[
    "session expired",
    "invalid terminal uuid",
    "klap 1002",
    "klap -1012",
    "terminal uuid mismatch",
];

impl From<StateError> for TapoError {
    fn from(err: StateError) -> Self {
        TapoError::Session(err.to_string())
    }
}

/// True when a device-reported message describes a dead session.
pub fn is_session_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    SESSION_ERROR_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Tracks one device's connection lifecycle and serializes refreshes.
pub struct SessionManager {
    state: Mutex<ConnectionState>,
    expires_at: Mutex<Option<Instant>>,
    refresh_gate: tokio::sync::Mutex<()>,
    refresh_threshold: Duration,
}

impl SessionManager {
    pub fn new(refresh_threshold: Duration) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            expires_at: Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            refresh_threshold,
        }
    }

    /// Current state, demoting `Connected` to `Expired` once the horizon
    /// has passed.
    pub fn state(&self) -> ConnectionState {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connected {
            let expired = match *self.expires_at.lock() {
                Some(at) => Instant::now() >= at,
                None => true,
            };
            if expired {
                *state = ConnectionState::Expired;
            }
        }
        *state
    }

    pub fn expires_at(&self) -> Option<Instant> {
        *self.expires_at.lock()
    }

    /// A session is valid while connected, unexpired, and the underlying
    /// protocol is still marked supported.
    pub fn is_valid(&self, protocol_supported: bool) -> bool {
        protocol_supported && self.state() == ConnectionState::Connected
    }

    pub fn begin_connecting(&self) -> Result<(), TapoError> {
        let mut state = self.state.lock();
        *state = state.transition(ConnectionState::Connecting)?;
        Ok(())
    }

    pub fn mark_connected(&self, expires_at: Instant) -> Result<(), TapoError> {
        {
            let mut state = self.state.lock();
            *state = state.transition(ConnectionState::Connected)?;
        }
        *self.expires_at.lock() = Some(expires_at);
        Ok(())
    }

    pub fn mark_expired(&self) {
        let mut state = self.state.lock();
        if let Ok(next) = state.transition(ConnectionState::Expired) {
            *state = next;
        }
    }

    pub fn mark_error(&self) {
        *self.state.lock() = ConnectionState::Error;
    }

    pub fn mark_disconnected(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        *self.expires_at.lock() = None;
    }

    /// True when the session is close enough to expiry that a proactive
    /// re-handshake is warranted.
    pub fn needs_refresh(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        match *self.expires_at.lock() {
            Some(at) => Instant::now() + self.refresh_threshold >= at,
            None => false,
        }
    }

    /// Runs `refresh` when the session needs one, with bounded retries.
    ///
    /// Only one refresh is in flight per device; concurrent callers block
    /// on the gate and observe the winner's outcome through the re-check.
    /// After three failed attempts the session lands in `Error`.
    pub async fn refresh_if_needed<F, Fut>(&self, refresh: F) -> Result<(), TapoError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Instant, TapoError>>,
    {
        if !self.needs_refresh() {
            return Ok(());
        }
        let _guard = self.refresh_gate.lock().await;
        if !self.needs_refresh() {
            return Ok(());
        }

        let mut last_err = None;
        for attempt in 1..=REFRESH_ATTEMPTS {
            match refresh().await {
                Ok(expires_at) => {
                    *self.expires_at.lock() = Some(expires_at);
                    *self.state.lock() = ConnectionState::Connected;
                    debug!(attempt, "session refreshed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "session refresh attempt failed");
                    last_err = Some(err);
                    if attempt < REFRESH_ATTEMPTS {
                        sleep(REFRESH_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
                    }
                }
            }
        }
        self.mark_error();
        Err(last_err.unwrap_or_else(|| TapoError::Session("session refresh failed".into())))
    }
}
