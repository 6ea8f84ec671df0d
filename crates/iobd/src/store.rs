//! In-memory [`Store`] implementation.
//!
//! Backs the daemon when no external store is configured, and every test.
//! State lives behind `parking_lot` locks that are never held across an
//! await point.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use iob_core::{
    ApiKeyRecord, CatalogEntry, CatalogKind, ConnectionId, Environment, HostInstance,
    HostInstanceStatus, OrganizationId, ResumableKind, ResumableState, SessionRecord, Store,
    StoreError, StoreResult, Transaction, TransactionFilter, TransactionId,
};

use crate::config::CredentialsConfig;

type CatalogKey = (OrganizationId, Environment, CatalogKind, String);

#[derive(Debug, Default)]
pub struct MemoryStore {
    api_keys: RwLock<HashMap<String, ApiKeyRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    instances: RwLock<HashMap<ConnectionId, HostInstance>>,
    catalog: RwLock<HashMap<CatalogKey, CatalogEntry>>,
    transactions: RwLock<HashMap<TransactionId, Transaction>>,
    resumable: RwLock<HashMap<TransactionId, ResumableState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store holding the configured credentials and nothing else.
    pub fn with_credentials(credentials: &CredentialsConfig) -> Self {
        let store = Self::new();
        for (token, record) in &credentials.api_keys {
            store.insert_api_key(token.clone(), record.clone());
        }
        for (token, record) in &credentials.sessions {
            store.insert_session(token.clone(), record.clone());
        }
        store
    }

    /// Makes `token` a valid host bearer credential.
    pub fn insert_api_key(&self, token: impl Into<String>, record: ApiKeyRecord) {
        self.api_keys.write().insert(token.into(), record);
    }

    /// Makes `token` a valid client session (cookie, or ghost key when
    /// `record.ghost` is set).
    pub fn insert_session(&self, token: impl Into<String>, record: SessionRecord) {
        self.sessions.write().insert(token.into(), record);
    }

    /// Snapshot of every catalog entry, unordered.
    pub fn catalog_entries(&self) -> Vec<CatalogEntry> {
        self.catalog.read().values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_api_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>> {
        Ok(self.api_keys.read().get(token).cloned())
    }

    async fn find_session(&self, token: &str, ghost: bool) -> StoreResult<Option<SessionRecord>> {
        Ok(self
            .sessions
            .read()
            .get(token)
            .filter(|s| s.ghost == ghost)
            .cloned())
    }

    async fn upsert_host_instance(&self, instance: HostInstance) -> StoreResult<()> {
        self.instances.write().insert(instance.id.clone(), instance);
        Ok(())
    }

    async fn host_instance(&self, id: &ConnectionId) -> StoreResult<Option<HostInstance>> {
        Ok(self.instances.read().get(id).cloned())
    }

    async fn host_instances(&self) -> StoreResult<Vec<HostInstance>> {
        Ok(self.instances.read().values().cloned().collect())
    }

    async fn set_host_status(
        &self,
        id: &ConnectionId,
        status: HostInstanceStatus,
    ) -> StoreResult<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("host instance {id}")))?;
        instance.status = status;
        instance.updated_at = Utc::now();
        Ok(())
    }

    async fn touch_host_instance(&self, id: &ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        let mut instances = self.instances.write();
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("host instance {id}")))?;
        instance.updated_at = at;
        Ok(())
    }

    async fn delete_host_instance(&self, id: &ConnectionId) -> StoreResult<bool> {
        Ok(self.instances.write().remove(id).is_some())
    }

    async fn upsert_catalog_entry(&self, entry: CatalogEntry) -> StoreResult<()> {
        let key = (
            entry.organization_id.clone(),
            entry.environment,
            entry.kind,
            entry.slug.clone(),
        );
        self.catalog.write().insert(key, entry);
        Ok(())
    }

    async fn catalog_entry(
        &self,
        organization_id: &OrganizationId,
        environment: Environment,
        kind: CatalogKind,
        slug: &str,
    ) -> StoreResult<Option<CatalogEntry>> {
        let key = (organization_id.clone(), environment, kind, slug.to_string());
        Ok(self.catalog.read().get(&key).cloned())
    }

    async fn disconnect_catalog_entries(
        &self,
        host: &ConnectionId,
        kind: CatalogKind,
        retained: &[String],
    ) -> StoreResult<Vec<String>> {
        let now = Utc::now();
        let mut disconnected = Vec::new();

        for entry in self.catalog.write().values_mut() {
            if entry.kind == kind
                && entry.host_instance_id.as_ref() == Some(host)
                && !retained.contains(&entry.slug)
            {
                entry.host_instance_id = None;
                entry.updated_at = now;
                disconnected.push(entry.slug.clone());
            }
        }

        disconnected.sort();
        Ok(disconnected)
    }

    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(&transaction.id) {
            return Err(StoreError::Conflict(format!(
                "transaction {}",
                transaction.id
            )));
        }
        transactions.insert(transaction.id.clone(), transaction);
        Ok(())
    }

    async fn transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        Ok(self.transactions.read().get(id).cloned())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write();
        let slot = transactions
            .get_mut(&transaction.id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", transaction.id)))?;
        *slot = transaction.clone();
        Ok(())
    }

    async fn transactions(&self, filter: TransactionFilter) -> StoreResult<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .values()
            .filter(|tx| filter.matches(tx))
            .cloned()
            .collect())
    }

    async fn save_resumable(
        &self,
        id: &TransactionId,
        kind: ResumableKind,
        value: serde_json::Value,
    ) -> StoreResult<()> {
        self.resumable
            .write()
            .entry(id.clone())
            .or_default()
            .set(kind, value);
        Ok(())
    }

    async fn resumable(&self, id: &TransactionId) -> StoreResult<ResumableState> {
        Ok(self.resumable.read().get(id).cloned().unwrap_or_default())
    }

    async fn clear_resumable(&self, id: &TransactionId) -> StoreResult<()> {
        self.resumable.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use iob_core::{ApiKeyId, SdkInfo, TransactionStatus, UserId};
    use serde_json::json;

    fn org() -> OrganizationId {
        OrganizationId::new("org-1")
    }

    fn entry(slug: &str, host: Option<&str>) -> CatalogEntry {
        CatalogEntry {
            organization_id: org(),
            environment: Environment::Production,
            kind: CatalogKind::Action,
            slug: slug.to_string(),
            name: None,
            description: None,
            backgroundable: false,
            host_instance_id: host.map(ConnectionId::new),
            updated_at: Utc::now(),
        }
    }

    fn tx(id: &str, host: &str) -> Transaction {
        Transaction::new(
            TransactionId::new(id),
            "update_user",
            org(),
            Environment::Production,
            ConnectionId::new(host),
            UserId::new("alice"),
            false,
        )
    }

    #[tokio::test]
    async fn test_session_lookup_respects_ghost_flag() {
        let store = MemoryStore::new();
        store.insert_session(
            "cookie",
            SessionRecord {
                user_id: UserId::new("alice"),
                organization_id: org(),
                environment: Environment::Production,
                ghost: false,
            },
        );

        assert!(store.find_session("cookie", false).await.unwrap().is_some());
        assert!(store.find_session("cookie", true).await.unwrap().is_none());
        assert!(store.find_session("other", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disconnect_only_undeclared_entries_of_host() {
        let store = MemoryStore::new();
        store.upsert_catalog_entry(entry("keep", Some("h1"))).await.unwrap();
        store.upsert_catalog_entry(entry("drop", Some("h1"))).await.unwrap();
        store.upsert_catalog_entry(entry("other", Some("h2"))).await.unwrap();

        let dropped = store
            .disconnect_catalog_entries(
                &ConnectionId::new("h1"),
                CatalogKind::Action,
                &["keep".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(dropped, vec!["drop".to_string()]);

        let drop_entry = store
            .catalog_entry(&org(), Environment::Production, CatalogKind::Action, "drop")
            .await
            .unwrap()
            .unwrap();
        assert!(drop_entry.host_instance_id.is_none());

        let other = store
            .catalog_entry(&org(), Environment::Production, CatalogKind::Action, "other")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(other.host_instance_id, Some(ConnectionId::new("h2")));
    }

    #[tokio::test]
    async fn test_transaction_insert_conflict_and_filter() {
        let store = MemoryStore::new();
        store.insert_transaction(tx("t1", "h1")).await.unwrap();
        assert!(matches!(
            store.insert_transaction(tx("t1", "h1")).await,
            Err(StoreError::Conflict(_))
        ));

        let mut done = tx("t2", "h1");
        done.complete(iob_core::TransactionResult::canceled(), Utc::now())
            .unwrap();
        store.insert_transaction(done).await.unwrap();

        let unfinished = store
            .transactions(TransactionFilter::UnfinishedOnHost(ConnectionId::new("h1")))
            .await
            .unwrap();
        assert_eq!(unfinished.len(), 1);

        let completed = store
            .transactions(TransactionFilter::Status(TransactionStatus::Completed))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_transaction() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.update_transaction(&tx("ghost", "h1")).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_resumable_roundtrip_and_clear() {
        let store = MemoryStore::new();
        let id = TransactionId::new("t1");
        store
            .save_resumable(&id, ResumableKind::LoadingState, json!({"label": "x"}))
            .await
            .unwrap();
        assert!(!store.resumable(&id).await.unwrap().is_empty());

        store.clear_resumable(&id).await.unwrap();
        assert!(store.resumable(&id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_status_on_missing_instance() {
        let store = MemoryStore::new();
        let id = ConnectionId::new("h1");
        assert!(store
            .set_host_status(&id, HostInstanceStatus::Offline)
            .await
            .is_err());

        let now = Utc::now();
        store
            .upsert_host_instance(HostInstance {
                id: id.clone(),
                api_key_id: ApiKeyId::new("k"),
                organization_id: org(),
                environment: Environment::Production,
                status: HostInstanceStatus::Online,
                sdk: SdkInfo {
                    name: "sdk".into(),
                    version: "1.0.0".into(),
                },
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .set_host_status(&id, HostInstanceStatus::ShuttingDown)
            .await
            .unwrap();
        assert_eq!(
            store.host_instance(&id).await.unwrap().unwrap().status,
            HostInstanceStatus::ShuttingDown
        );
        assert!(store.delete_host_instance(&id).await.unwrap());
    }
}
