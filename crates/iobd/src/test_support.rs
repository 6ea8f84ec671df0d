//! Fixtures shared by the unit tests of the broker modules.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use iob_core::{
    ApiKeyId, ApiKeyRecord, AuthContext, CatalogEntry, CatalogKind, ConnectionId, Environment,
    HostInstance, HostInstanceStatus, Notification, Notifier, NotifyError, OrganizationId,
    ResumableKind, ResumableState, SdkInfo, SessionRecord, Store, StoreError, StoreResult,
    Transaction, TransactionFilter, TransactionId, UserId,
};
use iob_protocol::Frame;

use crate::channel::{Channel, Outbound, Role};
use crate::config::RateLimits;
use crate::registry::{ClientEntry, HostEntry};
use crate::store::MemoryStore;

pub const ORG: &str = "org-1";

pub fn auth(user: &str) -> AuthContext {
    AuthContext {
        user_id: UserId::new(user),
        organization_id: OrganizationId::new(ORG),
        environment: Environment::Production,
    }
}

pub fn host_entry(id: &str) -> (HostEntry, mpsc::Receiver<Outbound>) {
    let (channel, rx) = Channel::new(
        ConnectionId::new(id),
        Role::Host,
        RateLimits::default().host,
        64,
    );
    let entry = HostEntry {
        channel,
        api_key_id: ApiKeyId::new("key-1"),
        auth: auth("dev"),
        sdk: SdkInfo {
            name: "@iob/sdk".to_string(),
            version: "0.21.0".to_string(),
        },
        connected_at: Utc::now(),
    };
    (entry, rx)
}

pub fn client_entry(id: &str, user: &str) -> (ClientEntry, mpsc::Receiver<Outbound>) {
    let (channel, rx) = Channel::new(
        ConnectionId::new(id),
        Role::Client,
        RateLimits::default().client,
        64,
    );
    let entry = ClientEntry {
        channel,
        auth: auth(user),
        ghost: false,
        connected_at: Utc::now(),
    };
    (entry, rx)
}

pub fn catalog_entry(
    kind: CatalogKind,
    slug: &str,
    host: &str,
    backgroundable: bool,
) -> CatalogEntry {
    CatalogEntry {
        organization_id: OrganizationId::new(ORG),
        environment: Environment::Production,
        kind,
        slug: slug.to_string(),
        name: None,
        description: None,
        backgroundable,
        host_instance_id: Some(ConnectionId::new(host)),
        updated_at: Utc::now(),
    }
}

/// Payloads of every call/send frame queued so far.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Text(text) = item {
            match Frame::decode(&text) {
                Ok(Frame::Call { payload, .. }) | Ok(Frame::Send { payload }) => out.push(payload),
                _ => {}
            }
        }
    }
    out
}

/// Method names of [`drain`].
pub fn methods(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
    drain(rx)
        .iter()
        .filter_map(|p| p.get("method").and_then(Value::as_str).map(String::from))
        .collect()
}

#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

/// A [`MemoryStore`] whose transaction updates fail for chosen ids.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    failing: Mutex<Vec<TransactionId>>,
}

impl FailingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_updates_of(&self, id: &TransactionId) {
        self.failing.lock().push(id.clone());
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn find_api_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>> {
        self.inner.find_api_key(token).await
    }

    async fn find_session(&self, token: &str, ghost: bool) -> StoreResult<Option<SessionRecord>> {
        self.inner.find_session(token, ghost).await
    }

    async fn upsert_host_instance(&self, instance: HostInstance) -> StoreResult<()> {
        self.inner.upsert_host_instance(instance).await
    }

    async fn host_instance(&self, id: &ConnectionId) -> StoreResult<Option<HostInstance>> {
        self.inner.host_instance(id).await
    }

    async fn host_instances(&self) -> StoreResult<Vec<HostInstance>> {
        self.inner.host_instances().await
    }

    async fn set_host_status(
        &self,
        id: &ConnectionId,
        status: HostInstanceStatus,
    ) -> StoreResult<()> {
        self.inner.set_host_status(id, status).await
    }

    async fn touch_host_instance(&self, id: &ConnectionId, at: DateTime<Utc>) -> StoreResult<()> {
        self.inner.touch_host_instance(id, at).await
    }

    async fn delete_host_instance(&self, id: &ConnectionId) -> StoreResult<bool> {
        self.inner.delete_host_instance(id).await
    }

    async fn upsert_catalog_entry(&self, entry: CatalogEntry) -> StoreResult<()> {
        self.inner.upsert_catalog_entry(entry).await
    }

    async fn catalog_entry(
        &self,
        organization_id: &OrganizationId,
        environment: Environment,
        kind: CatalogKind,
        slug: &str,
    ) -> StoreResult<Option<CatalogEntry>> {
        self.inner
            .catalog_entry(organization_id, environment, kind, slug)
            .await
    }

    async fn disconnect_catalog_entries(
        &self,
        host: &ConnectionId,
        kind: CatalogKind,
        retained: &[String],
    ) -> StoreResult<Vec<String>> {
        self.inner.disconnect_catalog_entries(host, kind, retained).await
    }

    async fn insert_transaction(&self, transaction: Transaction) -> StoreResult<()> {
        self.inner.insert_transaction(transaction).await
    }

    async fn transaction(&self, id: &TransactionId) -> StoreResult<Option<Transaction>> {
        self.inner.transaction(id).await
    }

    async fn update_transaction(&self, transaction: &Transaction) -> StoreResult<()> {
        if self.failing.lock().contains(&transaction.id) {
            return Err(StoreError::Unavailable(format!("update of {}", transaction.id)));
        }
        self.inner.update_transaction(transaction).await
    }

    async fn transactions(&self, filter: TransactionFilter) -> StoreResult<Vec<Transaction>> {
        self.inner.transactions(filter).await
    }

    async fn save_resumable(
        &self,
        id: &TransactionId,
        kind: ResumableKind,
        value: Value,
    ) -> StoreResult<()> {
        self.inner.save_resumable(id, kind, value).await
    }

    async fn resumable(&self, id: &TransactionId) -> StoreResult<ResumableState> {
        self.inner.resumable(id).await
    }

    async fn clear_resumable(&self, id: &TransactionId) -> StoreResult<()> {
        self.inner.clear_resumable(id).await
    }
}

/// Lets detached tasks spawned by the code under test run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}
