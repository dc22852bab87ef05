//! Health-tracked protocol selection with fallback.
//!
//! Each protocol slot counts consecutive errors: three make it unhealthy
//! (skipped while alternatives exist), five disable it for the device's
//! lifetime. A successful exchange pins the protocol as active and clears
//! its counter.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::ProtocolKind;
use crate::config::TapoConfig;

const UNHEALTHY_ERROR_COUNT: u32 = 3;
const DISABLE_ERROR_COUNT: u32 = 5;
const KLAP_MIN_INTERVAL: Duration = Duration::from_millis(200);

/// Per-protocol health record.
#[derive(Debug, Clone)]
pub struct ProtocolInfo {
    pub kind: ProtocolKind,
    pub supported: bool,
    pub priority: u8,
    pub last_used: Option<Instant>,
    pub consecutive_errors: u32,
}

impl ProtocolInfo {
    fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            supported: true,
            priority: kind.priority(),
            last_used: None,
            consecutive_errors: 0,
        }
    }
}

#[derive(Debug)]
pub struct ProtocolSelector {
    protocols: [ProtocolInfo; 2],
    active: Option<ProtocolKind>,
    preferred: ProtocolKind,
    enable_fallback: bool,
    min_request_interval: Duration,
}

impl ProtocolSelector {
    pub fn new(config: &TapoConfig) -> Self {
        Self {
            protocols: [
                ProtocolInfo::new(ProtocolKind::Klap),
                ProtocolInfo::new(ProtocolKind::Passthrough),
            ],
            active: None,
            preferred: config.preferred_protocol,
            enable_fallback: config.enable_fallback,
            min_request_interval: config.min_request_interval,
        }
    }

    fn info(&self, kind: ProtocolKind) -> &ProtocolInfo {
        self.protocols
            .iter()
            .find(|p| p.kind == kind)
            .expect("both protocols are registered")
    }

    fn info_mut(&mut self, kind: ProtocolKind) -> &mut ProtocolInfo {
        self.protocols
            .iter_mut()
            .find(|p| p.kind == kind)
            .expect("both protocols are registered")
    }

    pub fn is_healthy(&self, kind: ProtocolKind) -> bool {
        let info = self.info(kind);
        info.supported && info.consecutive_errors < UNHEALTHY_ERROR_COUNT
    }

    pub fn active(&self) -> Option<ProtocolKind> {
        self.active
    }

    pub fn protocol_info(&self, kind: ProtocolKind) -> &ProtocolInfo {
        self.info(kind)
    }

    /// Protocols to attempt, in order: a healthy active protocol wins
    /// outright; otherwise the preferred protocol, then (with fallback
    /// enabled) the alternatives by priority. Empty means no protocol is
    /// available.
    pub fn candidates(&self) -> Vec<ProtocolKind> {
        if let Some(active) = self.active {
            if self.is_healthy(active) {
                return vec![active];
            }
        }
        let mut out = Vec::new();
        if self.is_healthy(self.preferred) {
            out.push(self.preferred);
        }
        if self.enable_fallback {
            let mut rest: Vec<&ProtocolInfo> = self
                .protocols
                .iter()
                .filter(|p| p.kind != self.preferred)
                .collect();
            rest.sort_by_key(|p| p.priority);
            for info in rest {
                if self.is_healthy(info.kind) {
                    out.push(info.kind);
                }
            }
        }
        out
    }

    pub fn record_success(&mut self, kind: ProtocolKind) {
        self.active = Some(kind);
        let info = self.info_mut(kind);
        info.consecutive_errors = 0;
        info.last_used = Some(Instant::now());
    }

    pub fn record_error(&mut self, kind: ProtocolKind) {
        let info = self.info_mut(kind);
        info.consecutive_errors += 1;
        if info.consecutive_errors >= DISABLE_ERROR_COUNT {
            info.supported = false;
            debug!(protocol = %kind, "protocol disabled after repeated errors");
        }
        if self.active == Some(kind) {
            self.active = None;
        }
    }

    /// Re-enables both protocols and releases the active pin so the
    /// preferred order applies again.
    pub fn reset_errors(&mut self) {
        for info in &mut self.protocols {
            info.consecutive_errors = 0;
            info.supported = true;
        }
        self.active = None;
    }

    /// Rate-limit floor; KLAP devices need more headroom between frames.
    pub fn min_request_interval(&self) -> Duration {
        if self.active == Some(ProtocolKind::Klap) {
            self.min_request_interval.max(KLAP_MIN_INTERVAL)
        } else {
            self.min_request_interval
        }
    }
}
