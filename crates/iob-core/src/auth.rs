//! Authentication records and the per-connection auth context.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ApiKeyId, OrganizationId, UserId};

/// Deployment environment an API key or session is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Environment {
    #[default]
    Production,
    Development,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Production => write!(f, "PRODUCTION"),
            Self::Development => write!(f, "DEVELOPMENT"),
        }
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub environment: Environment,
}

/// API key a host presents as its bearer credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: ApiKeyId,
    /// User the key was issued to.
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    pub environment: Environment,
}

impl ApiKeyRecord {
    /// Auth context for a host authenticated with this key.
    pub fn auth_context(&self) -> AuthContext {
        AuthContext {
            user_id: self.user_id.clone(),
            organization_id: self.organization_id.clone(),
            environment: self.environment,
        }
    }
}

/// Dashboard session a client presents as a cookie (or ghost header).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub user_id: UserId,
    pub organization_id: OrganizationId,
    #[serde(default)]
    pub environment: Environment,
    /// Restricted impersonation session.
    #[serde(default)]
    pub ghost: bool,
}

impl SessionRecord {
    /// Auth context for a client authenticated with this session.
    pub fn auth_context(&self) -> AuthContext {
        AuthContext {
            user_id: self.user_id.clone(),
            organization_id: self.organization_id.clone(),
            environment: self.environment,
        }
    }
}
