//! WebSocket close codes used by the broker.

use std::fmt;

/// Graceful close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Bad auth, rate limit exceeded, or connection superseded.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Broker is restarting; peers should reconnect.
pub const CLOSE_SERVICE_RESTART: u16 = 1012;

/// Why the broker closed a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    PolicyViolation(String),
    ServiceRestart,
}

impl CloseReason {
    pub fn unauthorized() -> Self {
        Self::PolicyViolation("unauthorized".to_string())
    }

    pub fn rate_limited() -> Self {
        Self::PolicyViolation("rate limit exceeded".to_string())
    }

    pub fn superseded() -> Self {
        Self::PolicyViolation("superseded by a newer connection".to_string())
    }

    pub fn unresponsive() -> Self {
        Self::PolicyViolation("heartbeat timed out".to_string())
    }

    /// WebSocket close code.
    pub fn code(&self) -> u16 {
        match self {
            Self::Normal => CLOSE_NORMAL,
            Self::PolicyViolation(_) => CLOSE_POLICY_VIOLATION,
            Self::ServiceRestart => CLOSE_SERVICE_RESTART,
        }
    }

    /// Human-readable close reason.
    pub fn reason(&self) -> &str {
        match self {
            Self::Normal => "closed",
            Self::PolicyViolation(reason) => reason,
            Self::ServiceRestart => "service restart",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason(), self.code())
    }
}
