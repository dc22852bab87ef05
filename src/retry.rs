//! Bounded retry around top-level invocations.
//!
//! Pure decision logic: classify a failure as busy, session, or terminal,
//! then pick the next step from the operation category's policy. The device
//! facade owns the side effects (sleeping, re-handshaking, re-submitting).

use std::time::Duration;

use crate::error::TapoError;

const BUSY_PATTERNS: &[&str] = &["klap -1012", "device busy", "command timing issue"];
const SESSION_PATTERNS: &[&str] = &["klap 1002", "session expired", "invalid terminal uuid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// Per-category retry parameters.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    /// Delay to wait after the given 1-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.strategy {
            RetryStrategy::Fixed => self.base_delay,
            RetryStrategy::Linear => self.base_delay * attempt,
            RetryStrategy::Exponential => self.base_delay * 2u32.saturating_pow(attempt - 1),
        }
    }
}

/// Operation categories with their default policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationCategory {
    DeviceControl,
    InfoRetrieval,
    EnergyMonitoring,
}

impl OperationCategory {
    pub fn policy(self) -> RetryPolicy {
        match self {
            OperationCategory::DeviceControl => RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(3000),
                strategy: RetryStrategy::Linear,
            },
            OperationCategory::InfoRetrieval => RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1000),
                strategy: RetryStrategy::Fixed,
            },
            OperationCategory::EnergyMonitoring => RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1500),
                strategy: RetryStrategy::Fixed,
            },
        }
    }
}

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Busy,
    Session,
    Terminal,
}

pub fn classify(err: &TapoError) -> ErrorClass {
    if err.is_busy() {
        return ErrorClass::Busy;
    }
    let message = err.to_string().to_lowercase();
    if BUSY_PATTERNS.iter().any(|p| message.contains(p)) {
        return ErrorClass::Busy;
    }
    if matches!(err, TapoError::SessionExpired | TapoError::Session(_))
        || SESSION_PATTERNS.iter().any(|p| message.contains(p))
    {
        return ErrorClass::Session;
    }
    ErrorClass::Terminal
}

/// Next step after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then re-submit the same request.
    RetryAfter(Duration),
    /// Invalidate the session, re-handshake, and retry once.
    RefreshAndRetry,
    /// Give the error to the caller.
    Propagate,
}

/// Decides the next step. `attempt` is 1-based; `session_retried` is true
/// once the single post-refresh retry has been spent.
pub fn decide(
    policy: &RetryPolicy,
    attempt: u32,
    session_retried: bool,
    err: &TapoError,
) -> RetryDecision {
    match classify(err) {
        ErrorClass::Busy if attempt < policy.max_attempts => {
            RetryDecision::RetryAfter(policy.delay_for(attempt))
        }
        ErrorClass::Session if !session_retried => RetryDecision::RefreshAndRetry,
        _ => RetryDecision::Propagate,
    }
}
