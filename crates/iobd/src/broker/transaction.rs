//! Transaction broker.
//!
//! Owns the transaction state machine at runtime: relays renders from the
//! host to the current client and responses back, handles takeover and
//! resume-on-reconnect, and finalizes transactions abandoned by their
//! client.
//!
//! ```text
//!            host                    broker                    client
//!   START_TRANSACTION  ◀──────── start_transaction
//!                                       ◀────── CONNECT_TO_TRANSACTION_AS_CLIENT
//!   SEND_IO_CALL ─────────────▶ (AWAITING_INPUT) ──────▶ RENDER
//!                                       ◀────── RESPOND_TO_IO_CALL
//!   IO_RESPONSE  ◀──────────── (RUNNING)
//!   MARK_TRANSACTION_COMPLETE ▶ (COMPLETED) ───────────▶ TRANSACTION_COMPLETED
//! ```
//!
//! Every mutation of one transaction runs under that transaction's async
//! mutex: load, apply, persist, then deliver. Deliveries are
//! fire-and-forget; a peer that cannot be reached never fails the call
//! that triggered the delivery.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use iob_core::{
    AuthContext, CatalogKind, ConnectionId, DomainError, Notification, NotificationKind,
    Notifier, ResultStatus, ResumableKind, Store, Transaction, TransactionFilter, TransactionId,
    TransactionResult, TransactionStatus,
};
use iob_protocol::{
    ClientEvent, CompleteParams, HostCommand, IoResponseKind, IoResponseParams, LoadingParams,
    LogParams, NotifyParams, RedirectParams, RenderInstruction, RenderParams, RespondParams,
    SendIoCallParams, StartTransactionParams, TransactionCompletedParams, TransactionRef,
};

use crate::config::{RegistrationConfig, TransactionConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::host::await_host;
use crate::liveness::window;
use crate::registry::{ClientEntry, RegistryHandle};
use crate::task::spawn_detached;

pub struct TransactionBroker {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    registry: RegistryHandle,
    config: TransactionConfig,
    registration: RegistrationConfig,
    locks: Mutex<HashMap<TransactionId, Arc<AsyncMutex<()>>>>,
}

impl TransactionBroker {
    pub fn new(
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
        registry: RegistryHandle,
        config: TransactionConfig,
        registration: RegistrationConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            registry,
            config,
            registration,
            locks: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn lock(&self, id: &TransactionId) -> OwnedMutexGuard<()> {
        let mutex = Arc::clone(self.locks.lock().entry(id.clone()).or_default());
        mutex.lock_owned().await
    }

    fn forget_lock(&self, id: &TransactionId) {
        self.locks.lock().remove(id);
    }

    async fn load(&self, id: &TransactionId) -> BrokerResult<Transaction> {
        self.store
            .transaction(id)
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("transaction {id}")))
    }

    fn check_host(tx: &Transaction, host_id: &ConnectionId) -> BrokerResult<()> {
        if &tx.host_instance_id != host_id {
            return Err(BrokerError::forbidden(format!(
                "transaction {} belongs to another host",
                tx.id
            )));
        }
        Ok(())
    }

    fn check_owner(tx: &Transaction, auth: &AuthContext) -> BrokerResult<()> {
        if tx.owner_id != auth.user_id || tx.organization_id != auth.organization_id {
            return Err(BrokerError::forbidden(format!(
                "transaction {} is owned by another user",
                tx.id
            )));
        }
        Ok(())
    }

    fn check_open(tx: &Transaction) -> BrokerResult<()> {
        if tx.status.is_terminal() {
            return Err(DomainError::InvalidTransition {
                transaction_id: tx.id.clone(),
                from: tx.status,
                to: TransactionStatus::Running,
            }
            .into());
        }
        Ok(())
    }

    async fn current_client(&self, tx: &Transaction) -> Option<ClientEntry> {
        let id = tx.current_client_id.as_ref()?;
        self.registry.lookup_client(id).await
    }

    async fn send_to_client(&self, tx: &Transaction, event: &ClientEvent) -> bool {
        match self.current_client(tx).await {
            Some(client) => client.channel.send(event),
            None => false,
        }
    }

    async fn send_to_host(&self, tx: &Transaction, command: &HostCommand) -> bool {
        match self.registry.lookup_host(&tx.host_instance_id).await {
            Some(host) => host.channel.send(command),
            None => {
                debug!(
                    transaction_id = %tx.id,
                    connection_id = %tx.host_instance_id,
                    "Host not connected, command dropped"
                );
                false
            }
        }
    }

    fn dispatch_notification(&self, notification: Notification) {
        let notifier = Arc::clone(&self.notifier);
        spawn_detached("notify", async move { notifier.notify(notification).await });
    }

    fn owner_notification(
        tx: &Transaction,
        kind: NotificationKind,
        message: String,
    ) -> Notification {
        Notification {
            kind,
            organization_id: tx.organization_id.clone(),
            environment: tx.environment,
            user_id: Some(tx.owner_id.clone()),
            transaction_id: Some(tx.id.clone()),
            title: Some(tx.action_slug.clone()),
            message,
            deliveries: Vec::new(),
        }
    }

    /// Detaches the current client. Unfinished, non-backgroundable
    /// transactions that were running or had lost their host move to
    /// CLIENT_CONNECTION_DROPPED.
    fn detach_client(tx: &mut Transaction, now: DateTime<Utc>) -> BrokerResult<()> {
        let droppable = tx.status.is_in_progress()
            || tx.status == TransactionStatus::HostConnectionDropped;
        if droppable && !tx.backgroundable {
            tx.drop_client(now)?;
        } else {
            tx.current_client_id = None;
            tx.updated_at = now;
        }
        Ok(())
    }

    // ========================================================================
    // Entry point
    // ========================================================================

    /// Creates a PENDING transaction for `action_slug` and asks the host
    /// serving it to start.
    ///
    /// If the host is not connected yet, waits up to the deferred-handshake
    /// timeout for it to register.
    pub async fn start_transaction(
        &self,
        auth: &AuthContext,
        action_slug: &str,
        params: Option<serde_json::Value>,
    ) -> BrokerResult<TransactionId> {
        let entry = self
            .store
            .catalog_entry(
                &auth.organization_id,
                auth.environment,
                CatalogKind::Action,
                action_slug,
            )
            .await?
            .ok_or_else(|| BrokerError::not_found(format!("action {action_slug}")))?;

        let host_id = entry.host_instance_id.ok_or_else(|| {
            BrokerError::not_found(format!("action {action_slug} has no host"))
        })?;

        let host = match self.registry.lookup_host(&host_id).await {
            Some(host) => host,
            None => await_host(
                &self.registry,
                &host_id,
                self.registration.deferred_handshake_timeout(),
                self.registration.deferred_handshake_poll(),
            )
            .await
            .ok_or_else(|| BrokerError::not_found(format!("host {host_id}")))?,
        };

        let id = TransactionId::new(Uuid::new_v4().to_string());
        let tx = Transaction::new(
            id.clone(),
            action_slug,
            auth.organization_id.clone(),
            auth.environment,
            host_id.clone(),
            auth.user_id.clone(),
            entry.backgroundable,
        );
        self.store.insert_transaction(tx).await?;

        info!(
            transaction_id = %id,
            action_slug,
            connection_id = %host_id,
            user_id = %auth.user_id,
            "Transaction created"
        );

        host.channel.send(&HostCommand::StartTransaction(StartTransactionParams {
            transaction_id: id.clone(),
            action_slug: action_slug.to_string(),
            user: auth.clone(),
            params,
        }));

        Ok(id)
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// `CONNECT_TO_TRANSACTION_AS_CLIENT`: makes `client` current, usurping
    /// any previous client, and replays resumable state.
    pub async fn connect_client(
        &self,
        client: &ClientEntry,
        id: &TransactionId,
    ) -> BrokerResult<()> {
        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        Self::check_owner(&tx, &client.auth)?;
        Self::check_open(&tx)?;

        let client_id = client.id();
        if let Some(previous) = tx.current_client_id.clone().filter(|p| p != client_id) {
            if let Some(old) = self.registry.lookup_client(&previous).await {
                old.channel.send(&ClientEvent::ClientUsurped(TransactionRef {
                    transaction_id: id.clone(),
                }));
            }
            info!(
                transaction_id = %id,
                previous = %previous,
                connection_id = %client_id,
                "Client takeover"
            );
        }

        let now = Utc::now();
        match tx.status {
            TransactionStatus::Pending => tx.transition(TransactionStatus::Running, now)?,
            TransactionStatus::ClientConnectionDropped => tx.resume_client(now)?,
            _ => tx.updated_at = now,
        }
        tx.current_client_id = Some(client_id.clone());
        self.store.update_transaction(&tx).await?;

        let resumable = self.store.resumable(id).await?;
        for (kind, value) in resumable.replay_order() {
            let event = match kind {
                ResumableKind::IoCall => ClientEvent::Render(RenderParams {
                    transaction_id: id.clone(),
                    io_call: value.clone(),
                }),
                ResumableKind::LoadingState => ClientEvent::LoadingState(LoadingParams {
                    transaction_id: id.clone(),
                    state: value.clone(),
                }),
                ResumableKind::Redirect => ClientEvent::Redirect(RedirectParams {
                    transaction_id: id.clone(),
                    redirect: value.clone(),
                }),
            };
            client.channel.send(&event);
        }

        info!(
            transaction_id = %id,
            connection_id = %client_id,
            status = %tx.status,
            "Client attached"
        );
        Ok(())
    }

    /// `LEAVE_TRANSACTION`: detaches `client_id` if it is current.
    pub async fn leave_transaction(
        &self,
        client_id: &ConnectionId,
        id: &TransactionId,
    ) -> BrokerResult<()> {
        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;

        if tx.current_client_id.as_ref() != Some(client_id) {
            debug!(transaction_id = %id, connection_id = %client_id, "Leave by non-current client");
            return Ok(());
        }

        Self::detach_client(&mut tx, Utc::now())?;
        self.store.update_transaction(&tx).await?;
        info!(transaction_id = %id, connection_id = %client_id, status = %tx.status, "Client left");
        Ok(())
    }

    /// `RESPOND_TO_IO_CALL`: relays the user's response to the host.
    pub async fn respond_to_io_call(
        &self,
        client: &ClientEntry,
        params: RespondParams,
    ) -> BrokerResult<()> {
        let id = &params.transaction_id;
        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        Self::check_owner(&tx, &client.auth)?;

        if tx.current_client_id.as_ref() != Some(client.id()) {
            return Err(BrokerError::forbidden(format!(
                "{} is not the current client of {id}",
                client.id()
            )));
        }

        let host = self
            .registry
            .lookup_host(&tx.host_instance_id)
            .await
            .ok_or_else(|| BrokerError::not_found(format!("host {}", tx.host_instance_id)))?;

        if tx.status == TransactionStatus::AwaitingInput {
            tx.transition(TransactionStatus::Running, Utc::now())?;
        } else {
            Self::check_open(&tx)?;
        }
        self.store.update_transaction(&tx).await?;

        host.channel.send(&HostCommand::IoResponse(IoResponseParams {
            transaction_id: id.clone(),
            kind: IoResponseKind::Return,
            value: Some(params.io_response),
        }));
        debug!(transaction_id = %id, status = %tx.status, "IO response relayed");
        Ok(())
    }

    /// `CANCEL_TRANSACTION`: owner-issued cancellation.
    pub async fn cancel(&self, client: &ClientEntry, id: &TransactionId) -> BrokerResult<()> {
        let guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        Self::check_owner(&tx, &client.auth)?;

        tx.complete(TransactionResult::canceled(), Utc::now())?;
        self.store.update_transaction(&tx).await?;
        self.store.clear_resumable(id).await?;

        self.send_to_host(&tx, &cancel_command(id)).await;
        self.send_to_client(&tx, &completed_event(&tx)).await;
        info!(transaction_id = %id, connection_id = %client.id(), "Transaction canceled by owner");

        drop(guard);
        self.forget_lock(id);
        Ok(())
    }

    // ========================================================================
    // Host side
    // ========================================================================

    /// `SEND_IO_CALL`: stores and relays a render instruction.
    pub async fn send_io_call(
        &self,
        host_id: &ConnectionId,
        params: SendIoCallParams,
    ) -> BrokerResult<()> {
        let id = &params.transaction_id;
        let render = RenderInstruction::inspect(&params.io_call)
            .ok_or_else(|| BrokerError::Malformed(format!("render for {id}")))?;

        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        Self::check_host(&tx, host_id)?;

        let interactive = render.is_interactive();
        tx.apply_render(interactive, Utc::now())?;

        let repeated = tx.last_input_group_key.as_ref() == Some(&render.input_group_key);
        tx.last_input_group_key = Some(render.input_group_key.clone());
        self.store.update_transaction(&tx).await?;
        self.store
            .save_resumable(id, ResumableKind::IoCall, params.io_call.clone())
            .await?;

        let event = ClientEvent::Render(RenderParams {
            transaction_id: id.clone(),
            io_call: params.io_call,
        });
        let delivered = self.send_to_client(&tx, &event).await;

        if !delivered && interactive && !repeated {
            self.dispatch_notification(Self::owner_notification(
                &tx,
                NotificationKind::AwaitingInput,
                format!("{} is waiting for your input", tx.action_slug),
            ));
        }

        debug!(
            transaction_id = %id,
            input_group_key = %render.input_group_key,
            status = %tx.status,
            delivered,
            repeated,
            "Render relayed"
        );
        Ok(())
    }

    /// `SEND_LOADING_CALL`
    pub async fn send_loading_state(
        &self,
        host_id: &ConnectionId,
        params: LoadingParams,
    ) -> BrokerResult<()> {
        let id = params.transaction_id.clone();
        let _guard = self.lock(&id).await;
        let tx = self.load(&id).await?;
        Self::check_host(&tx, host_id)?;
        Self::check_open(&tx)?;

        self.store
            .save_resumable(&id, ResumableKind::LoadingState, params.state.clone())
            .await?;
        self.send_to_client(&tx, &ClientEvent::LoadingState(params))
            .await;
        Ok(())
    }

    /// `SEND_LOG`: relayed only, never replayed.
    pub async fn send_log(&self, host_id: &ConnectionId, params: LogParams) -> BrokerResult<()> {
        let tx = self.load(&params.transaction_id).await?;
        Self::check_host(&tx, host_id)?;
        Self::check_open(&tx)?;

        self.send_to_client(&tx, &ClientEvent::Log(params)).await;
        Ok(())
    }

    /// `SEND_REDIRECT`
    pub async fn send_redirect(
        &self,
        host_id: &ConnectionId,
        params: RedirectParams,
    ) -> BrokerResult<()> {
        let id = params.transaction_id.clone();
        let _guard = self.lock(&id).await;
        let tx = self.load(&id).await?;
        Self::check_host(&tx, host_id)?;
        Self::check_open(&tx)?;

        self.store
            .save_resumable(&id, ResumableKind::Redirect, params.redirect.clone())
            .await?;
        self.send_to_client(&tx, &ClientEvent::Redirect(params))
            .await;
        Ok(())
    }

    /// `MARK_TRANSACTION_COMPLETE`
    pub async fn mark_complete(
        &self,
        host_id: &ConnectionId,
        params: CompleteParams,
    ) -> BrokerResult<()> {
        let id = &params.transaction_id;
        let guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        Self::check_host(&tx, host_id)?;

        tx.complete(params.result, Utc::now())?;
        self.store.update_transaction(&tx).await?;
        self.store.clear_resumable(id).await?;

        let delivered = self.send_to_client(&tx, &completed_event(&tx)).await;
        if !delivered {
            self.dispatch_notification(Self::owner_notification(
                &tx,
                NotificationKind::Completed,
                format!("{} completed", tx.action_slug),
            ));
        }

        info!(
            transaction_id = %id,
            result = ?tx.result.as_ref().map(|r| r.status),
            headless = !delivered,
            "Transaction completed"
        );

        drop(guard);
        self.forget_lock(id);
        Ok(())
    }

    // ========================================================================
    // Notifications
    // ========================================================================

    /// `NOTIFY` from a host or client in `auth`'s organization.
    pub async fn notify(&self, auth: &AuthContext, params: NotifyParams) -> BrokerResult<()> {
        let mut user_id = None;
        if let Some(id) = &params.transaction_id {
            let tx = self.load(id).await?;
            if tx.organization_id != auth.organization_id {
                return Err(BrokerError::not_found(format!("transaction {id}")));
            }
            user_id = Some(tx.owner_id);
        }

        self.dispatch_notification(Notification {
            kind: NotificationKind::Custom,
            organization_id: auth.organization_id.clone(),
            environment: auth.environment,
            user_id,
            transaction_id: params.transaction_id,
            title: params.title,
            message: params.message,
            deliveries: params.deliveries,
        });
        Ok(())
    }

    // ========================================================================
    // Disconnects and sweep
    // ========================================================================

    /// A client socket closed: detach it from every transaction it drives.
    ///
    /// A transaction that fails to update is logged and skipped; the rest
    /// are still detached.
    pub async fn client_disconnected(&self, client_id: &ConnectionId) -> BrokerResult<usize> {
        let attached = self
            .store
            .transactions(TransactionFilter::CurrentClient(client_id.clone()))
            .await?;

        let mut detached = 0;
        for candidate in attached {
            match self.detach_one(&candidate.id, client_id).await {
                Ok(true) => detached += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    transaction_id = %candidate.id,
                    connection_id = %client_id,
                    error = %e,
                    "Failed to detach client from transaction"
                ),
            }
        }

        Ok(detached)
    }

    async fn detach_one(&self, id: &TransactionId, client_id: &ConnectionId) -> BrokerResult<bool> {
        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        if tx.current_client_id.as_ref() != Some(client_id) {
            return Ok(false);
        }

        Self::detach_client(&mut tx, Utc::now())?;
        self.store.update_transaction(&tx).await?;
        info!(transaction_id = %tx.id, connection_id = %client_id, status = %tx.status, "Client dropped");
        Ok(true)
    }

    /// A host socket closed: its unfinished transactions lose their host.
    ///
    /// Failures are per transaction, as in
    /// [`TransactionBroker::client_disconnected`].
    pub async fn host_disconnected(&self, host_id: &ConnectionId) -> BrokerResult<usize> {
        let unfinished = self
            .store
            .transactions(TransactionFilter::UnfinishedOnHost(host_id.clone()))
            .await?;

        let mut dropped = 0;
        for candidate in unfinished {
            match self.drop_host_of(&candidate.id, host_id).await {
                Ok(true) => dropped += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    transaction_id = %candidate.id,
                    connection_id = %host_id,
                    error = %e,
                    "Failed to record host loss"
                ),
            }
        }

        Ok(dropped)
    }

    async fn drop_host_of(&self, id: &TransactionId, host_id: &ConnectionId) -> BrokerResult<bool> {
        let _guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        if !tx.status.can_transition_to(TransactionStatus::HostConnectionDropped) {
            return Ok(false);
        }

        tx.drop_host(Utc::now())?;
        self.store.update_transaction(&tx).await?;
        self.send_to_client(
            &tx,
            &ClientEvent::HostClosedUnexpectedly(TransactionRef {
                transaction_id: tx.id.clone(),
            }),
        )
        .await;
        warn!(
            transaction_id = %tx.id,
            connection_id = %host_id,
            status = %tx.status,
            "Host dropped mid-transaction"
        );
        Ok(true)
    }

    /// Cancels transactions left in CLIENT_CONNECTION_DROPPED past the
    /// grace window. Each gets exactly one cancellation notice to its host.
    ///
    /// A transaction that cannot be canceled is logged and retried on the
    /// next sweep.
    pub async fn sweep_dropped(&self, now: DateTime<Utc>) -> BrokerResult<Vec<TransactionId>> {
        let grace = window(self.config.dropped_grace_secs);
        let dropped = self
            .store
            .transactions(TransactionFilter::Status(
                TransactionStatus::ClientConnectionDropped,
            ))
            .await?;

        let mut canceled = Vec::new();
        for candidate in dropped.into_iter().filter(|tx| tx.is_drop_expired(grace, now)) {
            match self.cancel_abandoned(&candidate.id, grace, now).await {
                Ok(true) => canceled.push(candidate.id),
                Ok(false) => {}
                Err(e) => warn!(
                    transaction_id = %candidate.id,
                    error = %e,
                    "Failed to cancel abandoned transaction"
                ),
            }
        }

        Ok(canceled)
    }

    async fn cancel_abandoned(
        &self,
        id: &TransactionId,
        grace: TimeDelta,
        now: DateTime<Utc>,
    ) -> BrokerResult<bool> {
        let guard = self.lock(id).await;
        let mut tx = self.load(id).await?;
        if !tx.is_drop_expired(grace, now) {
            return Ok(false);
        }

        tx.complete(TransactionResult::canceled(), now)?;
        self.store.update_transaction(&tx).await?;
        if !self.send_to_host(&tx, &cancel_command(&tx.id)).await {
            warn!(
                transaction_id = %tx.id,
                connection_id = %tx.host_instance_id,
                "Cancellation notice not delivered, host offline"
            );
        }
        if let Err(e) = self.store.clear_resumable(&tx.id).await {
            warn!(transaction_id = %tx.id, error = %e, "Failed to clear resumable events");
        }

        info!(transaction_id = %tx.id, "Abandoned transaction canceled");
        drop(guard);
        self.forget_lock(&tx.id);
        Ok(true)
    }

    /// Spawns the periodic [`TransactionBroker::sweep_dropped`].
    pub fn spawn_sweeper(self: Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.sweep_interval();
            let mut tick = interval_at(Instant::now() + period, period);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel_token.cancelled() => break,

                    _ = tick.tick() => {
                        match self.sweep_dropped(Utc::now()).await {
                            Ok(ids) if !ids.is_empty() => {
                                info!(count = ids.len(), "Dropped-transaction sweep");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Dropped-transaction sweep failed"),
                        }
                    }
                }
            }

            debug!("Transaction sweeper stopped");
        })
    }
}

fn cancel_command(id: &TransactionId) -> HostCommand {
    HostCommand::IoResponse(IoResponseParams {
        transaction_id: id.clone(),
        kind: IoResponseKind::Canceled,
        value: None,
    })
}

fn completed_event(tx: &Transaction) -> ClientEvent {
    ClientEvent::TransactionCompleted(TransactionCompletedParams {
        transaction_id: tx.id.clone(),
        status: tx.status,
        result_status: tx
            .result
            .as_ref()
            .map(|r| r.status)
            .unwrap_or(ResultStatus::Canceled),
    })
}
