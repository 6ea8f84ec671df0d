//! Type-safe identifiers.
//!
//! Every identifier the broker routes on is a distinct newtype so a
//! transaction id can never be passed where a connection id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates the identifier from any string-like value.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the underlying string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a live socket connection.
    ///
    /// Peers may supply it during the handshake so the id survives
    /// reconnects. For hosts it doubles as the persisted host-instance id.
    ConnectionId
);

string_id!(
    /// Identifier of a single action run.
    TransactionId
);

string_id!(
    /// Identifier of a dashboard user.
    UserId
);

string_id!(
    /// Identifier of an organization.
    OrganizationId
);

string_id!(
    /// Identifier of the API key a host authenticated with.
    ApiKeyId
);

string_id!(
    /// Identifier of one open page session.
    PageKey
);

string_id!(
    /// Idempotency marker of a logical render step.
    ///
    /// Two render calls with the same key are the same step re-delivered.
    InputGroupKey
);

impl ConnectionId {
    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_transparent_in_json() {
        let id = TransactionId::new("tx-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"tx-1\"");

        let parsed: ConnectionId = serde_json::from_str("\"conn-9\"").unwrap();
        assert_eq!(parsed.as_str(), "conn-9");
    }

    #[test]
    fn test_short_connection_id() {
        let id = ConnectionId::new("0123456789abcdef");
        assert_eq!(id.short(), "01234567");

        let tiny = ConnectionId::new("abc");
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn test_display() {
        assert_eq!(PageKey::from("pg_1").to_string(), "pg_1");
        assert_eq!(UserId::from("u".to_string()).as_ref(), "u");
    }
}
