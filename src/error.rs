//! Error taxonomy shared across the protocol, session, and device layers.
//!
//! Every failure surfaced to callers carries a stable kind tag (see
//! [`TapoError::kind`]) plus a human-readable message. Credentials and raw
//! ciphertext never appear in messages; transport and crypto layers report
//! lengths and status codes only.

use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;

/// Network-layer failure categories surfaced by the HTTP transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Connection actively refused by the peer.
    Refused,
    /// Host or network unreachable.
    Unreachable,
    /// The request did not complete within the configured timeout.
    Timeout,
    /// Connection reset mid-exchange.
    Reset,
    /// Server answered with a 5xx status.
    Status(u16),
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Refused => write!(f, "connection refused"),
            TransportErrorKind::Unreachable => write!(f, "host unreachable"),
            TransportErrorKind::Timeout => write!(f, "timed out"),
            TransportErrorKind::Reset => write!(f, "connection reset"),
            TransportErrorKind::Status(code) => write!(f, "http status {}", code),
        }
    }
}

/// Library-wide error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TapoError {
    /// Network-layer failure; the request may not have reached the device.
    #[error("transport error: {kind}")]
    Transport {
        kind: TransportErrorKind,
        message: String,
    },
    /// Handshake hash mismatch or credentials rejected by the device.
    #[error("{0}")]
    Auth(String),
    /// The device invalidated the session (remote code 1002 or equivalent).
    #[error("session expired")]
    SessionExpired,
    /// Session-level failure that is not a clean expiry (remote code -1001,
    /// terminal UUID mismatch, or a local lifecycle violation).
    #[error("session error: {0}")]
    Session(String),
    /// KLAP -1012 or an equivalent busy signal; retry after backoff.
    #[error("device busy")]
    DeviceBusy,
    /// Parameter validation failed locally or the device rejected the
    /// request shape (-1003, -1010).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Any other non-zero error code from the device.
    #[error("device returned error code {0}")]
    Remote(i32),
    /// Padding or decrypt failure in the cryptographic layer.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The device does not accept the attempted protocol; fall back.
    #[error("protocol not supported: {0}")]
    ProtocolUnsupported(String),
    /// Every registered protocol is unhealthy or disabled.
    #[error("no protocol available for this device")]
    NoProtocolAvailable,
    /// The operation requires a capability the model does not advertise.
    #[error("{0}")]
    FeatureNotSupported(String),
    /// The factory could not classify the model string.
    #[error("unknown device model: {0}")]
    UnknownDeviceModel(String),
    /// The request queue was cleared before this request was transmitted.
    #[error("request queue cleared")]
    QueueCleared,
    /// The request was cancelled before transmission.
    #[error("request cancelled")]
    Cancelled,
    /// The request missed its deadline.
    #[error("request timed out")]
    Timeout,
}

impl TapoError {
    /// Stable machine-readable tag for each error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TapoError::Transport { .. } => "transport",
            TapoError::Auth(_) => "auth",
            TapoError::SessionExpired => "session_expired",
            TapoError::Session(_) => "session",
            TapoError::DeviceBusy => "device_busy",
            TapoError::InvalidRequest(_) => "invalid_request",
            TapoError::Remote(_) => "remote",
            TapoError::Crypto(_) => "crypto",
            TapoError::ProtocolUnsupported(_) => "protocol_unsupported",
            TapoError::NoProtocolAvailable => "no_protocol_available",
            TapoError::FeatureNotSupported(_) => "feature_not_supported",
            TapoError::UnknownDeviceModel(_) => "unknown_device_model",
            TapoError::QueueCleared => "queue_cleared",
            TapoError::Cancelled => "cancelled",
            TapoError::Timeout => "timeout",
        }
    }

    /// True for busy signals that invite a retry after backoff.
    pub fn is_busy(&self) -> bool {
        matches!(self, TapoError::DeviceBusy)
    }

    /// True when the error invalidates the current session.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            TapoError::SessionExpired
                | TapoError::Session(_)
                | TapoError::Auth(_)
                | TapoError::Crypto(_)
        )
    }

    /// True when a retry without any session work could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TapoError::Transport { .. }
                | TapoError::DeviceBusy
                | TapoError::Timeout
                | TapoError::SessionExpired
                | TapoError::Session(_)
        )
    }
}
