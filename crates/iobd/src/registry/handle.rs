//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending
//! commands to the registry actor.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use tokio::sync::{mpsc, oneshot};

use iob_core::{ApiKeyId, ConnectionId, PageKey, UserId};

use super::commands::{
    ClientEntry, HostEntry, PageSession, RegistryCommand, RegistryCounts, RegistryError,
    Unregistered,
};

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// Queries return an empty answer (`None`, empty `Vec`) when the actor is
/// gone; mutations surface `RegistryError::ChannelClosed`.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Sends a command built around a fresh oneshot and waits for its reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;

        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Registers a host connection.
    ///
    /// Returns the connection it superseded, if one had the same id.
    ///
    /// # Errors
    ///
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register_host(
        &self,
        entry: HostEntry,
    ) -> Result<Option<Unregistered>, RegistryError> {
        self.request(|respond_to| RegistryCommand::RegisterHost {
            entry: Box::new(entry),
            respond_to,
        })
        .await
    }

    /// Registers a client connection, see [`RegistryHandle::register_host`].
    pub async fn register_client(
        &self,
        entry: ClientEntry,
    ) -> Result<Option<Unregistered>, RegistryError> {
        self.request(|respond_to| RegistryCommand::RegisterClient {
            entry: Box::new(entry),
            respond_to,
        })
        .await
    }

    /// Removes the socket with `serial` registered under `id`.
    ///
    /// Returns `None` if a newer socket has taken the id over, or if the
    /// actor is gone.
    pub async fn unregister(&self, id: ConnectionId, serial: u64) -> Option<Unregistered> {
        self.request(|respond_to| RegistryCommand::Unregister {
            id,
            serial,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn lookup_host(&self, id: &ConnectionId) -> Option<HostEntry> {
        let id = id.clone();
        self.request(|respond_to| RegistryCommand::LookupHost { id, respond_to })
            .await
            .ok()
            .flatten()
    }

    pub async fn lookup_client(&self, id: &ConnectionId) -> Option<ClientEntry> {
        let id = id.clone();
        self.request(|respond_to| RegistryCommand::LookupClient { id, respond_to })
            .await
            .ok()
            .flatten()
    }

    /// All live host connections authenticated with `api_key_id`.
    pub async fn hosts_by_api_key(&self, api_key_id: &ApiKeyId) -> Vec<HostEntry> {
        let api_key_id = api_key_id.clone();
        self.request(|respond_to| RegistryCommand::HostsByApiKey {
            api_key_id,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    /// All live client connections of `user_id`.
    pub async fn clients_by_user(&self, user_id: &UserId) -> Vec<ClientEntry> {
        let user_id = user_id.clone();
        self.request(|respond_to| RegistryCommand::ClientsByUser {
            user_id,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn page_session(&self, page_key: &PageKey) -> Option<PageSession> {
        let page_key = page_key.clone();
        self.request(|respond_to| RegistryCommand::GetPageSession {
            page_key,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    /// Records a page session.
    ///
    /// # Errors
    ///
    /// - `RegistryError::NotRegistered` if either side is not connected
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn set_page_session(&self, session: PageSession) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::SetPageSession {
            session,
            respond_to,
        })
        .await?
    }

    pub async fn clear_page_session(&self, page_key: &PageKey) -> Option<PageSession> {
        let page_key = page_key.clone();
        self.request(|respond_to| RegistryCommand::ClearPageSession {
            page_key,
            respond_to,
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn all_hosts(&self) -> Vec<HostEntry> {
        self.request(|respond_to| RegistryCommand::AllHosts { respond_to })
            .await
            .unwrap_or_default()
    }

    pub async fn all_clients(&self) -> Vec<ClientEntry> {
        self.request(|respond_to| RegistryCommand::AllClients { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Connection counts; all zero if the actor is gone.
    pub async fn counts(&self) -> RegistryCounts {
        self.request(|respond_to| RegistryCommand::Counts { respond_to })
            .await
            .unwrap_or_default()
    }

    /// Check if the actor is still running.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_handle() -> (RegistryHandle, mpsc::Receiver<RegistryCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        (RegistryHandle::new(cmd_tx), cmd_rx)
    }

    #[tokio::test]
    async fn test_handle_is_clone() {
        let (handle, _rx) = create_test_handle();
        let _cloned = handle.clone();
    }

    #[tokio::test]
    async fn test_unregister_sends_command() {
        let (handle, mut rx) = create_test_handle();

        let cmd_handler = tokio::spawn(async move {
            if let Some(RegistryCommand::Unregister {
                id,
                serial,
                respond_to,
            }) = rx.recv().await
            {
                assert_eq!(id.as_str(), "host-1");
                assert_eq!(serial, 7);
                let _ = respond_to.send(None);
                return true;
            }
            false
        });

        assert!(handle
            .unregister(ConnectionId::new("host-1"), 7)
            .await
            .is_none());
        assert!(cmd_handler.await.unwrap());
    }

    #[tokio::test]
    async fn test_set_page_session_channel_closed_error() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        let result = handle
            .set_page_session(PageSession {
                page_key: PageKey::new("pk-1"),
                page_slug: "overview".to_string(),
                host_id: ConnectionId::new("host-1"),
                client_id: ConnectionId::new("client-1"),
            })
            .await;

        assert!(matches!(result, Err(RegistryError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_queries_degrade_on_channel_close() {
        let (handle, rx) = create_test_handle();
        drop(rx);

        assert!(handle.lookup_host(&ConnectionId::new("h")).await.is_none());
        assert!(handle.all_clients().await.is_empty());
        assert!(handle
            .clients_by_user(&UserId::new("alice"))
            .await
            .is_empty());
        assert_eq!(handle.counts().await, RegistryCounts::default());
    }

    #[tokio::test]
    async fn test_is_connected() {
        let (handle, rx) = create_test_handle();
        assert!(handle.is_connected());

        drop(rx);
        assert!(!handle.is_connected());
    }
}
