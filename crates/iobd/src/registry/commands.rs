//! Registry actor commands, entries and errors.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `HostEntry` / `ClientEntry` / `PageSession`: what the registry stores
//! - `RegistryError`: Errors that can occur during registry operations
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use iob_core::{ApiKeyId, AuthContext, ConnectionId, PageKey, SdkInfo, UserId};

use crate::channel::Channel;

// ============================================================================
// Registry Entries
// ============================================================================

/// A registered host connection.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub channel: Arc<Channel>,
    pub api_key_id: ApiKeyId,
    pub auth: AuthContext,
    pub sdk: SdkInfo,
    pub connected_at: DateTime<Utc>,
}

impl HostEntry {
    /// The connection id, which is also the host-instance id.
    pub fn id(&self) -> &ConnectionId {
        self.channel.id()
    }
}

/// A registered dashboard client connection.
#[derive(Debug, Clone)]
pub struct ClientEntry {
    pub channel: Arc<Channel>,
    pub auth: AuthContext,
    /// Connected through the impersonation header.
    pub ghost: bool,
    pub connected_at: DateTime<Utc>,
}

impl ClientEntry {
    pub fn id(&self) -> &ConnectionId {
        self.channel.id()
    }
}

/// An open page: which host renders it for which client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageSession {
    pub page_key: PageKey,
    pub page_slug: String,
    pub host_id: ConnectionId,
    pub client_id: ConnectionId,
}

impl PageSession {
    /// Returns true if `id` is either side of the session.
    pub fn involves(&self, id: &ConnectionId) -> bool {
        &self.host_id == id || &self.client_id == id
    }
}

/// What was removed when a connection left the registry.
#[derive(Debug, Clone)]
pub enum Unregistered {
    Host {
        entry: HostEntry,
        /// Page sessions torn down with the connection.
        pages: Vec<PageSession>,
    },
    Client {
        entry: ClientEntry,
        pages: Vec<PageSession>,
    },
}

impl Unregistered {
    pub fn pages(&self) -> &[PageSession] {
        match self {
            Self::Host { pages, .. } | Self::Client { pages, .. } => pages,
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        match self {
            Self::Host { entry, .. } => &entry.channel,
            Self::Client { entry, .. } => &entry.channel,
        }
    }
}

/// Connection counts, as reported by `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub hosts: usize,
    pub clients: usize,
    pub pages: usize,
}

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each command uses a oneshot channel for the response, enabling
/// request-response patterns in async code without blocking.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Register a host connection.
    ///
    /// An existing host with the same id is closed as superseded and
    /// returned.
    RegisterHost {
        entry: Box<HostEntry>,
        respond_to: oneshot::Sender<Option<Unregistered>>,
    },

    /// Register a client connection, superseding any with the same id.
    RegisterClient {
        entry: Box<ClientEntry>,
        respond_to: oneshot::Sender<Option<Unregistered>>,
    },

    /// Remove a connection and every page session it is part of.
    ///
    /// Nothing is removed unless the registered socket has `serial`, so a
    /// superseded socket closing late cannot remove its replacement.
    Unregister {
        id: ConnectionId,
        serial: u64,
        respond_to: oneshot::Sender<Option<Unregistered>>,
    },

    LookupHost {
        id: ConnectionId,
        respond_to: oneshot::Sender<Option<HostEntry>>,
    },

    LookupClient {
        id: ConnectionId,
        respond_to: oneshot::Sender<Option<ClientEntry>>,
    },

    HostsByApiKey {
        api_key_id: ApiKeyId,
        respond_to: oneshot::Sender<Vec<HostEntry>>,
    },

    ClientsByUser {
        user_id: UserId,
        respond_to: oneshot::Sender<Vec<ClientEntry>>,
    },

    GetPageSession {
        page_key: PageKey,
        respond_to: oneshot::Sender<Option<PageSession>>,
    },

    /// Record a page session. Fails unless both sides are registered.
    SetPageSession {
        session: PageSession,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    ClearPageSession {
        page_key: PageKey,
        respond_to: oneshot::Sender<Option<PageSession>>,
    },

    AllHosts {
        respond_to: oneshot::Sender<Vec<HostEntry>>,
    },

    AllClients {
        respond_to: oneshot::Sender<Vec<ClientEntry>>,
    },

    Counts {
        respond_to: oneshot::Sender<RegistryCounts>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A page session names a connection that is not registered.
    #[error("connection not registered: {0}")]
    NotRegistered(ConnectionId),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}
