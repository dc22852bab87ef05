//! Wire envelopes and protocol dispatch shared by KLAP and passthrough.
//!
//! Both protocols carry the same inner JSON request/response shape; they
//! differ only in how the bytes are protected on the wire. The inner
//! `result` is arbitrary JSON, modeled as `serde_json::Value` and projected
//! into typed records by the device layer.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use crate::error::TapoError;

pub mod klap;
pub mod passthrough;
pub mod selector;

pub use klap::KlapSession;
pub use passthrough::PassthroughSession;
pub use selector::{ProtocolInfo, ProtocolSelector};

use crate::transport::Transport;

/// The two mutually exclusive on-wire protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Klap,
    Passthrough,
}

impl ProtocolKind {
    /// Lower value is tried first.
    pub fn priority(self) -> u8 {
        match self {
            ProtocolKind::Klap => 1,
            ProtocolKind::Passthrough => 2,
        }
    }

    pub fn other(self) -> ProtocolKind {
        match self {
            ProtocolKind::Klap => ProtocolKind::Passthrough,
            ProtocolKind::Passthrough => ProtocolKind::Klap,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::Klap => write!(f, "klap"),
            ProtocolKind::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Inner request envelope serialized into the encrypted payload.
#[derive(Debug, Clone, Serialize)]
pub struct TapoRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(rename = "requestTimeMils")]
    pub request_time_mils: u64,
    #[serde(rename = "terminalUUID", skip_serializing_if = "Option::is_none")]
    pub terminal_uuid: Option<String>,
}

impl TapoRequest {
    pub fn new(method: &str, params: Value, terminal_uuid: Option<String>) -> Self {
        let params = if params.is_null() { None } else { Some(params) };
        Self {
            method: method.to_string(),
            params,
            request_time_mils: now_ms(),
            terminal_uuid,
        }
    }
}

/// Inner response envelope recovered from the decrypted payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TapoResponse {
    pub error_code: i32,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub msg: Option<String>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Maps a device `error_code` onto the library taxonomy.
pub fn check_error_code(code: i32) -> Result<(), TapoError> {
    match code {
        0 => Ok(()),
        -1012 => Err(TapoError::DeviceBusy),
        -1003 | -1010 => Err(TapoError::InvalidRequest(format!(
            "device rejected request shape (code {code})"
        ))),
        -1501 => Err(TapoError::Auth("invalid credentials".into())),
        -1001 => Err(TapoError::Session(format!("klap {code}"))),
        1002 => Err(TapoError::SessionExpired),
        other => Err(TapoError::Remote(other)),
    }
}

/// Applies the envelope rules to a decrypted JSON object: non-zero
/// `error_code` maps to an error; a success envelope without `result`
/// yields the whole object (set-calls answer this way).
pub fn extract_result(envelope: Value) -> Result<Value, TapoError> {
    let code = envelope
        .get("error_code")
        .and_then(Value::as_i64)
        .unwrap_or(0) as i32;
    check_error_code(code)?;
    match envelope.get("result") {
        Some(result) => Ok(result.clone()),
        None => Ok(envelope),
    }
}

/// A live, authenticated session over either protocol.
pub enum ActiveSession<T: Transport> {
    Klap(KlapSession<T>),
    Passthrough(PassthroughSession<T>),
}

impl<T: Transport> ActiveSession<T> {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ActiveSession::Klap(_) => ProtocolKind::Klap,
            ActiveSession::Passthrough(_) => ProtocolKind::Passthrough,
        }
    }

    pub fn expires_at(&self) -> Instant {
        match self {
            ActiveSession::Klap(session) => session.expires_at(),
            ActiveSession::Passthrough(session) => session.expires_at(),
        }
    }

    /// Serializes, protects, and transmits one request; returns the inner
    /// result value.
    pub async fn execute(&mut self, method: &str, params: Value) -> Result<Value, TapoError> {
        match self {
            ActiveSession::Klap(session) => session.execute(method, params).await,
            ActiveSession::Passthrough(session) => session.execute(method, params).await,
        }
    }
}
