//! Page sessions: a client asks for a page, the host serving it renders
//! it, and either side may close it.
//!
//! Page sessions live only in the registry. Nothing about them is
//! persisted, and they end with either connection.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use iob_core::{CatalogKind, ConnectionId, PageKey, Store};
use iob_protocol::{
    ClientEvent, ClosePageParams, HostCommand, OpenPageParams, RenderPageParams,
    RequestPageParams, RequestPageReply, SendPageParams,
};

use crate::config::TransactionConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{ClientEntry, PageSession, RegistryHandle};

pub struct PageBroker {
    store: Arc<dyn Store>,
    registry: RegistryHandle,
    config: TransactionConfig,
}

impl PageBroker {
    pub fn new(store: Arc<dyn Store>, registry: RegistryHandle, config: TransactionConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// `REQUEST_PAGE`: opens a page session and waits for the host to
    /// accept `OPEN_PAGE`.
    pub async fn request_page(
        &self,
        client: &ClientEntry,
        params: RequestPageParams,
    ) -> BrokerResult<RequestPageReply> {
        let auth = &client.auth;
        let slug = params.page_slug;

        let entry = self
            .store
            .catalog_entry(&auth.organization_id, auth.environment, CatalogKind::Page, &slug)
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("page {slug}")))?;
        let host_id = entry
            .host_instance_id
            .ok_or_else(|| BrokerError::not_found(format!("page {slug} has no host")))?;
        let host = self
            .registry
            .lookup_host(&host_id)
            .await
            .ok_or_else(|| BrokerError::not_found(format!("host {host_id}")))?;

        let page_key = PageKey::new(Uuid::new_v4().to_string());
        self.registry
            .set_page_session(PageSession {
                page_key: page_key.clone(),
                page_slug: slug.clone(),
                host_id: host_id.clone(),
                client_id: client.id().clone(),
            })
            .await?;

        let open = HostCommand::OpenPage(OpenPageParams {
            page_key: page_key.clone(),
            page_slug: slug.clone(),
            user: auth.clone(),
            params: params.params,
        });

        if let Err(e) = host.channel.call(&open, self.config.call_timeout()).await {
            self.registry.clear_page_session(&page_key).await;
            debug!(page_key = %page_key, page_slug = %slug, error = %e, "Host refused page");
            return Err(e.into());
        }

        info!(
            page_key = %page_key,
            page_slug = %slug,
            connection_id = %host_id,
            client = %client.id(),
            "Page opened"
        );
        Ok(RequestPageReply { page_key })
    }

    /// `SEND_PAGE`: relays a page render to the session's client.
    pub async fn send_page(
        &self,
        host_id: &ConnectionId,
        params: SendPageParams,
    ) -> BrokerResult<()> {
        let key = &params.page_key;
        let session = self
            .registry
            .page_session(key)
            .await
            .ok_or_else(|| BrokerError::not_found(format!("page {key}")))?;

        if &session.host_id != host_id {
            return Err(BrokerError::forbidden(format!(
                "page {key} belongs to another host"
            )));
        }

        let Some(client) = self.registry.lookup_client(&session.client_id).await else {
            self.registry.clear_page_session(key).await;
            return Err(BrokerError::not_found(format!(
                "client {} of page {key}",
                session.client_id
            )));
        };

        client.channel.send(&ClientEvent::RenderPage(RenderPageParams {
            page_key: params.page_key,
            page: params.page,
        }));
        Ok(())
    }

    /// `LEAVE_PAGE` from either side.
    pub async fn leave_page(&self, by: &ConnectionId, key: &PageKey) -> BrokerResult<()> {
        let session = self
            .registry
            .page_session(key)
            .await
            .ok_or_else(|| BrokerError::not_found(format!("page {key}")))?;

        if !session.involves(by) {
            return Err(BrokerError::forbidden(format!("page {key}")));
        }

        self.registry.clear_page_session(key).await;
        self.close_peer(&session, by).await;
        info!(page_key = %key, connection_id = %by, "Page closed");
        Ok(())
    }

    /// Tells the surviving side of each session that its peer is gone.
    ///
    /// The registry has already dropped `pages` along with the connection
    /// `gone`.
    pub async fn connection_gone(&self, gone: &ConnectionId, pages: &[PageSession]) {
        for session in pages {
            self.close_peer(session, gone).await;
        }
        if !pages.is_empty() {
            debug!(connection_id = %gone, pages = pages.len(), "Pages closed with connection");
        }
    }

    async fn close_peer(&self, session: &PageSession, by: &ConnectionId) {
        let params = ClosePageParams {
            page_key: session.page_key.clone(),
        };

        if &session.host_id == by {
            if let Some(client) = self.registry.lookup_client(&session.client_id).await {
                client.channel.send(&ClientEvent::ClosePage(params));
            }
        } else if let Some(host) = self.registry.lookup_host(&session.host_id).await {
            host.channel.send(&HostCommand::ClosePage(params));
        }
    }
}
