//! Action and page catalog entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ConnectionId, Environment, OrganizationId};

/// Longest slug a host may declare.
pub const MAX_SLUG_LEN: usize = 64;

/// What a catalog entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogKind {
    Action,
    Page,
}

/// Durable catalog entry, reconciled on every host registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub organization_id: OrganizationId,
    pub environment: Environment,
    pub kind: CatalogKind,
    pub slug: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Transactions of this action keep running when their client leaves.
    pub backgroundable: bool,
    /// Host instance currently serving the entry; `None` once disconnected.
    pub host_instance_id: Option<ConnectionId>,
    pub updated_at: DateTime<Utc>,
}

/// Returns true if `slug` is 1-64 characters of `[A-Za-z0-9_-]`.
pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && slug.len() <= MAX_SLUG_LEN
        && slug
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_slugs() {
        assert!(is_valid_slug("update_user"));
        assert!(is_valid_slug("refund-2"));
        assert!(is_valid_slug(&"a".repeat(MAX_SLUG_LEN)));
    }

    #[test]
    fn test_invalid_slugs() {
        assert!(!is_valid_slug(""));
        assert!(!is_valid_slug("has space"));
        assert!(!is_valid_slug("emoji🙂"));
        assert!(!is_valid_slug("a/b"));
        assert!(!is_valid_slug(&"a".repeat(MAX_SLUG_LEN + 1)));
    }
}
