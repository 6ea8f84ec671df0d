//! Host registration protocol.
//!
//! `INITIALIZE_HOST` runs through [`HostRegistrar::initialize`]:
//!
//! 1. SDK check (too old or unparseable ⇒ structured `ERROR` reply)
//! 2. ordered admission through the [`RegistrationQueue`]
//! 3. slug validation
//! 4. upsert of the host instance (ONLINE)
//! 5. registration in the connection registry
//! 6. catalog reconciliation, detached; the permit is held until it ends
//!
//! The host gets its `SUCCESS` reply as soon as step 5 is done.

mod registration;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use iob_core::{
    is_valid_slug, ApiKeyRecord, CatalogEntry, CatalogKind, ConnectionId, Environment,
    HostInstance, HostInstanceStatus, OrganizationId, SdkInfo, Store, StoreError, StoreResult,
};
use iob_protocol::{
    ActionDefinition, InitializeHostParams, InitializeHostReply, PageDefinition, SdkAlert,
    SdkVersion, VersionError,
};

use crate::channel::Channel;
use crate::config::RegistrationConfig;
use crate::registry::{HostEntry, RegistryError, RegistryHandle, Unregistered};
use crate::task::spawn_detached;

pub use registration::{RegistrationPermit, RegistrationQueue};

#[derive(Debug, Clone, Error)]
pub enum RegistrationError {
    #[error("registration of {connection_id} not admitted within {waited:?}")]
    QueueTimeout {
        connection_id: ConnectionId,
        waited: Duration,
    },

    #[error("invalid minimum SDK version: {0}")]
    InvalidMinimumVersion(#[from] VersionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Outcome of a host handshake.
#[derive(Debug)]
pub struct HostRegistration {
    pub reply: InitializeHostReply,
    /// The earlier socket with the same id, closed by this registration.
    pub superseded: Option<Unregistered>,
}

#[derive(Clone)]
pub struct HostRegistrar {
    store: Arc<dyn Store>,
    registry: RegistryHandle,
    queue: Arc<RegistrationQueue>,
    min_sdk: SdkVersion,
    config: RegistrationConfig,
}

impl HostRegistrar {
    /// # Errors
    ///
    /// `RegistrationError::InvalidMinimumVersion` if `min_sdk_version`
    /// does not parse.
    pub fn new(
        store: Arc<dyn Store>,
        registry: RegistryHandle,
        min_sdk_version: &str,
        config: RegistrationConfig,
    ) -> Result<Self, RegistrationError> {
        Ok(Self {
            store,
            registry,
            queue: RegistrationQueue::new(),
            min_sdk: SdkVersion::parse(min_sdk_version)?,
            config,
        })
    }

    pub fn queue(&self) -> &Arc<RegistrationQueue> {
        &self.queue
    }

    /// Runs the handshake for an authenticated host socket.
    ///
    /// # Errors
    ///
    /// - `RegistrationError::QueueTimeout` if an earlier registration of
    ///   the same id holds the queue too long
    /// - `RegistrationError::Store` / `Registry` on collaborator failure
    pub async fn initialize(
        &self,
        channel: Arc<Channel>,
        api_key: &ApiKeyRecord,
        params: InitializeHostParams,
        submitted_at: DateTime<Utc>,
    ) -> Result<HostRegistration, RegistrationError> {
        let id = channel.id().clone();

        if let Some(reply) = self.check_sdk(&params) {
            warn!(
                connection_id = %id,
                sdk_name = %params.sdk_name,
                sdk_version = %params.sdk_version,
                "Host SDK rejected"
            );
            return Ok(HostRegistration {
                reply,
                superseded: None,
            });
        }

        let permit = self
            .queue
            .admit(&id, submitted_at, self.config.queue_timeout())
            .await?;

        let (actions, invalid_actions): (Vec<_>, Vec<_>) = params
            .actions
            .into_iter()
            .partition(|a| is_valid_slug(&a.slug));
        let (pages, invalid_pages): (Vec<_>, Vec<_>) = params
            .pages
            .into_iter()
            .partition(|p| is_valid_slug(&p.slug));
        let invalid_slugs: Vec<String> = invalid_actions
            .into_iter()
            .map(|a| a.slug)
            .chain(invalid_pages.into_iter().map(|p| p.slug))
            .collect();

        let sdk = SdkInfo {
            name: params.sdk_name,
            version: params.sdk_version,
        };
        let now = Utc::now();
        let created_at = self
            .store
            .host_instance(&id)
            .await?
            .map(|existing| existing.created_at)
            .unwrap_or(now);

        self.store
            .upsert_host_instance(HostInstance {
                id: id.clone(),
                api_key_id: api_key.id.clone(),
                organization_id: api_key.organization_id.clone(),
                environment: api_key.environment,
                status: HostInstanceStatus::Online,
                sdk: sdk.clone(),
                created_at,
                updated_at: now,
            })
            .await?;

        let superseded = self
            .registry
            .register_host(HostEntry {
                channel,
                api_key_id: api_key.id.clone(),
                auth: api_key.auth_context(),
                sdk,
                connected_at: now,
            })
            .await?;

        info!(
            connection_id = %id,
            organization_id = %api_key.organization_id,
            actions = actions.len(),
            pages = pages.len(),
            invalid = invalid_slugs.len(),
            "Host initialized"
        );

        let reconcile = CatalogReconciliation {
            store: Arc::clone(&self.store),
            host: id.clone(),
            organization_id: api_key.organization_id.clone(),
            environment: api_key.environment,
            actions,
            pages,
        };
        spawn_detached("catalog-reconcile", async move {
            let _permit = permit;
            reconcile.run().await
        });

        Ok(HostRegistration {
            reply: InitializeHostReply::Success {
                connection_id: id,
                organization_id: api_key.organization_id.clone(),
                invalid_slugs,
            },
            superseded,
        })
    }

    fn check_sdk(&self, params: &InitializeHostParams) -> Option<InitializeHostReply> {
        let message = match SdkVersion::parse(&params.sdk_version) {
            Ok(version) if !version.is_older_than(&self.min_sdk) => return None,
            Ok(version) => format!(
                "{} {} is no longer supported, please upgrade to {} or newer",
                params.sdk_name, version, self.min_sdk
            ),
            Err(e) => e.to_string(),
        };

        Some(InitializeHostReply::Error {
            message: message.clone(),
            sdk_alert: Some(SdkAlert {
                minimum_version: self.min_sdk.to_string(),
                message,
            }),
        })
    }

    /// `BEGIN_HOST_SHUTDOWN`: the instance is draining.
    pub async fn begin_shutdown(&self, id: &ConnectionId) -> StoreResult<()> {
        self.store
            .set_host_status(id, HostInstanceStatus::ShuttingDown)
            .await?;
        info!(connection_id = %id, "Host shutting down");
        Ok(())
    }

    /// The host socket is gone.
    pub async fn disconnected(&self, id: &ConnectionId) {
        match self
            .store
            .set_host_status(id, HostInstanceStatus::Offline)
            .await
        {
            Ok(()) => info!(connection_id = %id, "Host instance offline"),
            Err(StoreError::NotFound(_)) => {
                debug!(connection_id = %id, "Disconnected host had no instance record");
            }
            Err(e) => warn!(connection_id = %id, error = %e, "Failed to mark host offline"),
        }
    }
}

// ============================================================================
// Catalog reconciliation
// ============================================================================

struct CatalogReconciliation {
    store: Arc<dyn Store>,
    host: ConnectionId,
    organization_id: OrganizationId,
    environment: Environment,
    actions: Vec<ActionDefinition>,
    pages: Vec<PageDefinition>,
}

impl CatalogReconciliation {
    fn entry(
        &self,
        kind: CatalogKind,
        slug: String,
        name: Option<String>,
        description: Option<String>,
        backgroundable: bool,
    ) -> CatalogEntry {
        CatalogEntry {
            organization_id: self.organization_id.clone(),
            environment: self.environment,
            kind,
            slug,
            name,
            description,
            backgroundable,
            host_instance_id: Some(self.host.clone()),
            updated_at: Utc::now(),
        }
    }

    async fn run(self) -> StoreResult<()> {
        let mut action_slugs = Vec::with_capacity(self.actions.len());
        for action in &self.actions {
            action_slugs.push(action.slug.clone());
            let entry = self.entry(
                CatalogKind::Action,
                action.slug.clone(),
                action.name.clone(),
                action.description.clone(),
                action.backgroundable,
            );
            self.store.upsert_catalog_entry(entry).await?;
        }

        let mut page_slugs = Vec::with_capacity(self.pages.len());
        for page in &self.pages {
            page_slugs.push(page.slug.clone());
            let entry = self.entry(
                CatalogKind::Page,
                page.slug.clone(),
                page.name.clone(),
                page.description.clone(),
                false,
            );
            self.store.upsert_catalog_entry(entry).await?;
        }

        let dropped_actions = self
            .store
            .disconnect_catalog_entries(&self.host, CatalogKind::Action, &action_slugs)
            .await?;
        let dropped_pages = self
            .store
            .disconnect_catalog_entries(&self.host, CatalogKind::Page, &page_slugs)
            .await?;

        info!(
            connection_id = %self.host,
            actions = action_slugs.len(),
            pages = page_slugs.len(),
            disconnected = dropped_actions.len() + dropped_pages.len(),
            "Catalog reconciled"
        );
        Ok(())
    }
}

// ============================================================================
// Deferred handshake
// ============================================================================

/// Polls the registry until host `id` is connected or `timeout` passes.
///
/// Used when a transaction targets a host whose handshake has been
/// triggered out of band and has not arrived yet.
pub async fn await_host(
    registry: &RegistryHandle,
    id: &ConnectionId,
    timeout: Duration,
    poll: Duration,
) -> Option<HostEntry> {
    let deadline = Instant::now() + timeout;

    loop {
        if let Some(entry) = registry.lookup_host(id).await {
            return Some(entry);
        }
        if Instant::now() + poll > deadline {
            debug!(connection_id = %id, "Deferred host handshake did not arrive");
            return None;
        }
        sleep(poll).await;
    }
}
