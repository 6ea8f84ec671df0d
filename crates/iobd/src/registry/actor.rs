//! Registry actor - owns all routing state and processes commands.
//!
//! The RegistryActor is the single owner of the connection maps. It
//! receives commands via an mpsc channel and answers on oneshot channels;
//! no map is ever touched from outside its task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Reply send failures are ignored (the caller went away)

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use iob_core::{ApiKeyId, ConnectionId, PageKey, UserId};
use iob_protocol::CloseReason;

use super::commands::{
    ClientEntry, HostEntry, PageSession, RegistryCommand, RegistryCounts, RegistryError,
    Unregistered,
};

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all routing state.
///
/// # Ownership
///
/// The actor owns:
/// - `hosts` / `clients`: connection id → entry, one map per role
/// - `hosts_by_api_key` / `clients_by_user`: secondary indices
/// - `pages`: page key → page session
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    hosts: HashMap<ConnectionId, HostEntry>,
    clients: HashMap<ConnectionId, ClientEntry>,
    hosts_by_api_key: HashMap<ApiKeyId, HashSet<ConnectionId>>,
    clients_by_user: HashMap<UserId, HashSet<ConnectionId>>,
    pages: HashMap<PageKey, PageSession>,
}

impl RegistryActor {
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            receiver,
            hosts: HashMap::new(),
            clients: HashMap::new(),
            hosts_by_api_key: HashMap::new(),
            clients_by_user: HashMap::new(),
            pages: HashMap::new(),
        }
    }

    /// Runs the actor event loop until every handle is dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            hosts = self.hosts.len(),
            clients = self.clients.len(),
            "Registry actor stopped"
        );
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::RegisterHost { entry, respond_to } => {
                let _ = respond_to.send(self.handle_register_host(*entry));
            }
            RegistryCommand::RegisterClient { entry, respond_to } => {
                let _ = respond_to.send(self.handle_register_client(*entry));
            }
            RegistryCommand::Unregister {
                id,
                serial,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_unregister(&id, serial));
            }
            RegistryCommand::LookupHost { id, respond_to } => {
                let _ = respond_to.send(self.hosts.get(&id).cloned());
            }
            RegistryCommand::LookupClient { id, respond_to } => {
                let _ = respond_to.send(self.clients.get(&id).cloned());
            }
            RegistryCommand::HostsByApiKey {
                api_key_id,
                respond_to,
            } => {
                let hosts = self
                    .hosts_by_api_key
                    .get(&api_key_id)
                    .map(|ids| ids.iter().filter_map(|id| self.hosts.get(id).cloned()).collect())
                    .unwrap_or_default();
                let _ = respond_to.send(hosts);
            }
            RegistryCommand::ClientsByUser {
                user_id,
                respond_to,
            } => {
                let clients = self
                    .clients_by_user
                    .get(&user_id)
                    .map(|ids| ids.iter().filter_map(|id| self.clients.get(id).cloned()).collect())
                    .unwrap_or_default();
                let _ = respond_to.send(clients);
            }
            RegistryCommand::GetPageSession {
                page_key,
                respond_to,
            } => {
                let _ = respond_to.send(self.pages.get(&page_key).cloned());
            }
            RegistryCommand::SetPageSession {
                session,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_set_page_session(session));
            }
            RegistryCommand::ClearPageSession {
                page_key,
                respond_to,
            } => {
                let removed = self.pages.remove(&page_key);
                if removed.is_some() {
                    debug!(page_key = %page_key, "Page session cleared");
                }
                let _ = respond_to.send(removed);
            }
            RegistryCommand::AllHosts { respond_to } => {
                let _ = respond_to.send(self.hosts.values().cloned().collect());
            }
            RegistryCommand::AllClients { respond_to } => {
                let _ = respond_to.send(self.clients.values().cloned().collect());
            }
            RegistryCommand::Counts { respond_to } => {
                let _ = respond_to.send(RegistryCounts {
                    hosts: self.hosts.len(),
                    clients: self.clients.len(),
                    pages: self.pages.len(),
                });
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register_host(&mut self, entry: HostEntry) -> Option<Unregistered> {
        let id = entry.id().clone();

        let evicted = match self.remove_host(&id) {
            // A socket repeating its own handshake replaces its entry in place.
            Some(old) if old.channel.serial() == entry.channel.serial() => {
                debug!(connection_id = %id, "Host re-registered on the same socket");
                None
            }
            Some(old) => {
                old.channel.close(CloseReason::superseded());
                warn!(connection_id = %id, role = "host", "Superseded existing connection");
                Some(Unregistered::Host {
                    pages: self.remove_pages_of(&id),
                    entry: old,
                })
            }
            None => None,
        };

        self.hosts_by_api_key
            .entry(entry.api_key_id.clone())
            .or_default()
            .insert(id.clone());

        info!(
            connection_id = %id,
            organization_id = %entry.auth.organization_id,
            total_hosts = self.hosts.len() + 1,
            "Host registered"
        );
        self.hosts.insert(id, entry);

        evicted
    }

    fn handle_register_client(&mut self, entry: ClientEntry) -> Option<Unregistered> {
        let id = entry.id().clone();

        let evicted = match self.remove_client(&id) {
            Some(old) if old.channel.serial() == entry.channel.serial() => {
                debug!(connection_id = %id, "Client re-registered on the same socket");
                None
            }
            Some(old) => {
                old.channel.close(CloseReason::superseded());
                warn!(connection_id = %id, role = "client", "Superseded existing connection");
                Some(Unregistered::Client {
                    pages: self.remove_pages_of(&id),
                    entry: old,
                })
            }
            None => None,
        };

        self.clients_by_user
            .entry(entry.auth.user_id.clone())
            .or_default()
            .insert(id.clone());

        info!(
            connection_id = %id,
            user_id = %entry.auth.user_id,
            total_clients = self.clients.len() + 1,
            "Client registered"
        );
        self.clients.insert(id, entry);

        evicted
    }

    fn handle_unregister(&mut self, id: &ConnectionId, serial: u64) -> Option<Unregistered> {
        if self.hosts.get(id).is_some_and(|e| e.channel.serial() == serial) {
            let entry = self.remove_host(id)?;
            info!(connection_id = %id, role = "host", "Connection unregistered");
            return Some(Unregistered::Host {
                pages: self.remove_pages_of(id),
                entry,
            });
        }

        if self.clients.get(id).is_some_and(|e| e.channel.serial() == serial) {
            let entry = self.remove_client(id)?;
            info!(connection_id = %id, role = "client", "Connection unregistered");
            return Some(Unregistered::Client {
                pages: self.remove_pages_of(id),
                entry,
            });
        }

        debug!(
            connection_id = %id,
            serial,
            "Unregister ignored: socket not current"
        );
        None
    }

    fn handle_set_page_session(&mut self, session: PageSession) -> Result<(), RegistryError> {
        if !self.hosts.contains_key(&session.host_id) {
            return Err(RegistryError::NotRegistered(session.host_id));
        }
        if !self.clients.contains_key(&session.client_id) {
            return Err(RegistryError::NotRegistered(session.client_id));
        }

        debug!(
            page_key = %session.page_key,
            host_id = %session.host_id,
            client_id = %session.client_id,
            "Page session set"
        );
        self.pages.insert(session.page_key.clone(), session);
        Ok(())
    }

    // ========================================================================
    // Map maintenance
    // ========================================================================

    fn remove_host(&mut self, id: &ConnectionId) -> Option<HostEntry> {
        let entry = self.hosts.remove(id)?;
        if let Some(ids) = self.hosts_by_api_key.get_mut(&entry.api_key_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.hosts_by_api_key.remove(&entry.api_key_id);
            }
        }
        Some(entry)
    }

    fn remove_client(&mut self, id: &ConnectionId) -> Option<ClientEntry> {
        let entry = self.clients.remove(id)?;
        if let Some(ids) = self.clients_by_user.get_mut(&entry.auth.user_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.clients_by_user.remove(&entry.auth.user_id);
            }
        }
        Some(entry)
    }

    fn remove_pages_of(&mut self, id: &ConnectionId) -> Vec<PageSession> {
        let keys: Vec<PageKey> = self
            .pages
            .values()
            .filter(|s| s.involves(id))
            .map(|s| s.page_key.clone())
            .collect();

        keys.iter().filter_map(|k| self.pages.remove(k)).collect()
    }
}
