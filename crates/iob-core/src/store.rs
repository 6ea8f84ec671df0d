//! Persistent store interface.
//!
//! The broker treats the durable store as the cross-restart source of
//! truth for transactions, the catalog and host instances. Only the
//! narrow set of operations the broker needs is modelled here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    ApiKeyRecord, CatalogEntry, CatalogKind, ConnectionId, Environment, HostInstance,
    HostInstanceStatus, OrganizationId, ResumableKind, ResumableState, SessionRecord, Transaction,
    TransactionId, TransactionStatus,
};

/// Errors surfaced by a store implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("record already exists: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Selects a subset of transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionFilter {
    /// Transactions whose current client is this connection.
    CurrentClient(ConnectionId),
    /// Non-completed transactions running on this host instance.
    UnfinishedOnHost(ConnectionId),
    /// Transactions in this status.
    Status(TransactionStatus),
}

impl TransactionFilter {
    /// Returns true if `tx` is selected by the filter.
    pub fn matches(&self, tx: &Transaction) -> bool {
        match self {
            Self::CurrentClient(id) => tx.current_client_id.as_ref() == Some(id),
            Self::UnfinishedOnHost(id) => &tx.host_instance_id == id && !tx.status.is_terminal(),
            Self::Status(status) => tx.status == *status,
        }
    }
}

/// Durable key/value records used by the broker.
#[async_trait]
pub trait Store: Send + Sync {
    /// Looks up the API key behind a host bearer token.
    async fn find_api_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>>;

    /// Looks up a dashboard session by cookie value, or by ghost-mode key
    /// when `ghost` is set.
    async fn find_session(&self, token: &str, ghost: bool) -> StoreResult<Option<SessionRecord>>;

    async fn upsert_host_instance(&self, instance: HostInstance) -> StoreResult<()>;

    async fn host_instance(&self, id: &ConnectionId) -> StoreResult<Option<HostInstance>>;

    async fn host_instances(&self) -> StoreResult<Vec<HostInstance>>;

    /// Changes the status without touching `updated_at`.
    async fn set_host_status(&self, id: &ConnectionId, status: HostInstanceStatus)
        -> StoreResult<()>;

    /// Records that the host was heard from at `at`.
    async fn touch_host_instance(&self, id: &ConnectionId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Returns true if an instance was deleted.
    async fn delete_host_instance(&self, id: &ConnectionId) -> StoreResult<bool>;

    async fn upsert_catalog_entry(&self, entry: CatalogEntry) -> StoreResult<()>;

    async fn catalog_entry(
        &self,
        organization_id: &OrganizationId,
        environment: Environment,
        kind: CatalogKind,
        slug: &str,
    ) -> StoreResult<Option<CatalogEntry>>;

    /// Detaches every entry of `kind` served by `host` whose slug is not in
    /// `retained`. Returns the detached slugs.
    async fn disconnect_catalog_entries(
        &self,
        host: &ConnectionId,
        kind: CatalogKind,
        retained: &[String],
    ) -> StoreResult<Vec<String>>;

    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<()>;

    async fn transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>>;

    /// Replaces an existing transaction record.
    async fn update_transaction(&self, transaction: &Transaction) -> StoreResult<()>;

    async fn transactions(&self, filter: TransactionFilter) -> StoreResult<Vec<Transaction>>;

    async fn save_resumable(
        &self,
        id: &TransactionId,
        kind: ResumableKind,
        value: serde_json::Value,
    ) -> StoreResult<()>;

    async fn resumable(&self, id: &TransactionId) -> StoreResult<ResumableState>;

    async fn clear_resumable(&self, id: &TransactionId) -> StoreResult<()>;
}
