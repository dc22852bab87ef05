//! Client configuration and account credentials.

use std::env;
use std::fmt;
use std::time::Duration;

use crate::protocol::ProtocolKind;

/// Tapo cloud-account credentials bound to a device instance.
///
/// The password never appears in `Debug` output, log lines, or error
/// messages; only the username (account email) is ever shown.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Tunable client options with environment overrides.
///
/// Every field has a constructor default; `from_env()` layers `TAPO_*`
/// millisecond overrides on top. Durations are never zero.
#[derive(Debug, Clone)]
pub struct TapoConfig {
    /// Per-HTTP-call timeout for regular requests.
    pub connection_timeout: Duration,
    /// Per-HTTP-call timeout for handshake rounds.
    pub handshake_timeout: Duration,
    /// Rate-limit floor between transmissions to one device.
    pub min_request_interval: Duration,
    /// Protocol attempted first on connect.
    pub preferred_protocol: ProtocolKind,
    /// Whether the selector may try the alternative protocol.
    pub enable_fallback: bool,
    /// Horizon after which a session is considered expired.
    pub session_lifetime: Duration,
    /// Window before expiry in which a refresh is triggered.
    pub refresh_threshold: Duration,
    /// How long the registry reuses a cached device instance.
    pub device_cache_ttl: Duration,
    /// How long the factory reuses a probed `get_device_info` result.
    pub info_cache_ttl: Duration,
}

impl Default for TapoConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_millis(10_000),
            handshake_timeout: Duration::from_millis(15_000),
            min_request_interval: Duration::from_millis(100),
            preferred_protocol: ProtocolKind::Klap,
            enable_fallback: true,
            session_lifetime: Duration::from_millis(1_800_000),
            refresh_threshold: Duration::from_millis(300_000),
            device_cache_ttl: Duration::from_millis(300_000),
            info_cache_ttl: Duration::from_millis(30_000),
        }
    }
}

impl TapoConfig {
    /// Defaults overlaid with any `TAPO_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_ms("TAPO_CONNECTION_TIMEOUT_MS") {
            config.connection_timeout = ms;
        }
        if let Some(ms) = env_ms("TAPO_HANDSHAKE_TIMEOUT_MS") {
            config.handshake_timeout = ms;
        }
        if let Some(ms) = env_ms("TAPO_MIN_REQUEST_INTERVAL_MS") {
            config.min_request_interval = ms;
        }
        if let Some(ms) = env_ms("TAPO_SESSION_LIFETIME_MS") {
            config.session_lifetime = ms;
        }
        if let Some(ms) = env_ms("TAPO_REFRESH_THRESHOLD_MS") {
            config.refresh_threshold = ms;
        }
        if let Some(ms) = env_ms("TAPO_DEVICE_CACHE_TTL_MS") {
            config.device_cache_ttl = ms;
        }
        if let Some(ms) = env_ms("TAPO_INFO_CACHE_TTL_MS") {
            config.info_cache_ttl = ms;
        }
        if let Ok(value) = env::var("TAPO_PREFERRED_PROTOCOL") {
            match value.to_ascii_lowercase().as_str() {
                "klap" => config.preferred_protocol = ProtocolKind::Klap,
                "passthrough" => config.preferred_protocol = ProtocolKind::Passthrough,
                _ => {}
            }
        }
        if let Ok(value) = env::var("TAPO_ENABLE_FALLBACK") {
            config.enable_fallback = value != "0" && !value.eq_ignore_ascii_case("false");
        }
        config
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
