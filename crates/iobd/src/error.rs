//! Handler error taxonomy.
//!
//! Every call handler returns `Result<Value, BrokerError>`. The connection
//! task turns an `Err` into an error response frame with
//! [`BrokerError::code`] and keeps the socket open; only
//! `Authentication` and `RateLimited` ever close a connection, and those
//! are raised by the server, not by handlers.

use thiserror::Error;

use iob_core::{DomainError, StoreError};
use iob_protocol::{ErrorBody, ErrorCode, ProtocolError};

use crate::channel::ChannelError;
use crate::host::RegistrationError;
use crate::registry::RegistryError;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error(transparent)]
    InvalidTransition(#[from] DomainError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The call is not valid for this connection's role or state.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BrokerError {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::NotFound(what.to_string())
    }

    pub fn forbidden(what: impl std::fmt::Display) -> Self {
        Self::Forbidden(what.to_string())
    }

    /// Stable wire code for the error response.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Authentication(_) => ErrorCode::Unauthorized,
            Self::RateLimited => ErrorCode::Unavailable,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Delivery(_) => ErrorCode::Unavailable,
            Self::Malformed(_) => ErrorCode::Malformed,
            Self::InvalidTransition(_) => ErrorCode::InvalidTransition,
            Self::Store(StoreError::NotFound(_)) => ErrorCode::NotFound,
            Self::Store(_) => ErrorCode::Unavailable,
            Self::Unsupported(_) => ErrorCode::Unsupported,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<ChannelError> for BrokerError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Timeout { .. } => Self::Timeout(err.to_string()),
            ChannelError::Remote { code, message } => match code {
                ErrorCode::NotFound => Self::NotFound(message),
                ErrorCode::Forbidden => Self::Forbidden(message),
                ErrorCode::Malformed => Self::Malformed(message),
                _ => Self::Delivery(format!("{code}: {message}")),
            },
            ChannelError::Protocol(e) => Self::Malformed(e.to_string()),
            ChannelError::Closed(_) | ChannelError::Backpressure(_) => {
                Self::Delivery(err.to_string())
            }
        }
    }
}

impl From<ProtocolError> for BrokerError {
    fn from(err: ProtocolError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<RegistryError> for BrokerError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotRegistered(id) => Self::NotFound(format!("connection {id}")),
            RegistryError::ChannelClosed => Self::Delivery(err.to_string()),
        }
    }
}

impl From<RegistrationError> for BrokerError {
    fn from(err: RegistrationError) -> Self {
        match err {
            RegistrationError::QueueTimeout { .. } => Self::Timeout(err.to_string()),
            RegistrationError::InvalidMinimumVersion(e) => Self::Malformed(e.to_string()),
            RegistrationError::Store(e) => Self::Store(e),
            RegistrationError::Registry(e) => e.into(),
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;
