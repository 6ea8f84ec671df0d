//! Handshake authentication.
//!
//! | Peer | Credential |
//! |---|---|
//! | host | `Authorization: Bearer <api key>` |
//! | client | `iob_session` cookie |
//! | ghost client | `x-iob-ghost-key` header |
//!
//! Either peer may send `x-iob-connection-id` to keep its connection id
//! across reconnects.

use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::HeaderMap;
use uuid::Uuid;

use iob_core::{ApiKeyRecord, ConnectionId, SessionRecord, Store};

use crate::error::{BrokerError, BrokerResult};

pub const SESSION_COOKIE: &str = "iob_session";
pub const GHOST_HEADER: &str = "x-iob-ghost-key";
pub const CONNECTION_ID_HEADER: &str = "x-iob-connection-id";

/// Longest accepted client-supplied connection id.
const MAX_CONNECTION_ID_LEN: usize = 128;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    header(headers, AUTHORIZATION.as_str())?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim())
        .filter(|v| !v.is_empty())
}

/// The connection id the peer asked for, or a fresh one.
pub fn connection_id(headers: &HeaderMap) -> ConnectionId {
    header(headers, CONNECTION_ID_HEADER)
        .filter(|id| id.len() <= MAX_CONNECTION_ID_LEN)
        .map(ConnectionId::from)
        .unwrap_or_else(|| ConnectionId::new(Uuid::new_v4().to_string()))
}

pub async fn authenticate_host(store: &dyn Store, headers: &HeaderMap) -> BrokerResult<ApiKeyRecord> {
    let token = bearer_token(headers)
        .ok_or_else(|| BrokerError::Authentication("missing bearer token".into()))?;

    store
        .find_api_key(token)
        .await?
        .ok_or_else(|| BrokerError::Authentication("unknown API key".into()))
}

/// Returns the session and whether it is a ghost session.
pub async fn authenticate_client(
    store: &dyn Store,
    headers: &HeaderMap,
) -> BrokerResult<(SessionRecord, bool)> {
    let (token, ghost) = match header(headers, GHOST_HEADER) {
        Some(key) => (key, true),
        None => (
            session_cookie(headers)
                .ok_or_else(|| BrokerError::Authentication("missing session".into()))?,
            false,
        ),
    };

    let session = store
        .find_session(token, ghost)
        .await?
        .ok_or_else(|| BrokerError::Authentication("unknown session".into()))?;
    Ok((session, ghost))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use iob_core::{ApiKeyId, Environment, OrganizationId, UserId};

    use crate::store::MemoryStore;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    fn session(ghost: bool) -> SessionRecord {
        SessionRecord {
            user_id: UserId::new("alice"),
            organization_id: OrganizationId::new("org-1"),
            environment: Environment::Production,
            ghost,
        }
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc")])),
            Some("abc")
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic abc")])), None);
        assert_eq!(bearer_token(&headers(&[("authorization", "Bearer ")])), None);
    }

    #[test]
    fn test_session_cookie_among_others() {
        let h = headers(&[("cookie", "theme=dark; iob_session=s1 ; other=x")]);
        assert_eq!(session_cookie(&h), Some("s1"));
        assert_eq!(session_cookie(&headers(&[("cookie", "theme=dark")])), None);
    }

    #[test]
    fn test_connection_id() {
        let h = headers(&[(CONNECTION_ID_HEADER, "host-7")]);
        assert_eq!(connection_id(&h), ConnectionId::new("host-7"));

        let long = "x".repeat(MAX_CONNECTION_ID_LEN + 1);
        let generated = connection_id(&headers(&[(CONNECTION_ID_HEADER, long.as_str())]));
        assert_ne!(generated.as_str(), long);
        assert!(Uuid::parse_str(generated.as_str()).is_ok());
    }

    #[tokio::test]
    async fn test_authenticate_host() {
        let store = MemoryStore::new();
        store.insert_api_key(
            "live-key",
            ApiKeyRecord {
                id: ApiKeyId::new("key-1"),
                user_id: UserId::new("dev"),
                organization_id: OrganizationId::new("org-1"),
                environment: Environment::Production,
            },
        );

        let ok = authenticate_host(&store, &headers(&[("authorization", "Bearer live-key")]))
            .await
            .unwrap();
        assert_eq!(ok.id, ApiKeyId::new("key-1"));

        let err = authenticate_host(&store, &headers(&[("authorization", "Bearer nope")]))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Authentication(_)));
    }

    #[tokio::test]
    async fn test_ghost_header_only_matches_ghost_sessions() {
        let store = MemoryStore::new();
        store.insert_session("s1", session(false));
        store.insert_session("g1", session(true));

        let (_, ghost) = authenticate_client(&store, &headers(&[("cookie", "iob_session=s1")]))
            .await
            .unwrap();
        assert!(!ghost);

        let (_, ghost) = authenticate_client(&store, &headers(&[(GHOST_HEADER, "g1")]))
            .await
            .unwrap();
        assert!(ghost);

        assert!(authenticate_client(&store, &headers(&[(GHOST_HEADER, "s1")]))
            .await
            .is_err());
    }
}
