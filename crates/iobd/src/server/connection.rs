//! One WebSocket connection, host or client.
//!
//! Each socket gets a [`Channel`] plus three tasks:
//!
//! ```text
//!             ┌──────────── reader (this task) ─────────────┐
//!  socket ───▶│ decode Frame ─▶ response? ─▶ Channel::resolve│
//!             │              └▶ call/send ─▶ rate limit ─▶ dispatch (in order)
//!             └──────────────────────────────────────────────┘
//!  socket ◀── writer task ◀── Outbound queue ◀── Channel::send/call/reply
//!             heartbeat task ── ping every interval, close when silent
//! ```
//!
//! Inbound calls are dispatched one at a time in arrival order, which
//! keeps per-connection ordering. A handler error becomes an error
//! response; a handler panic becomes an `INTERNAL` error response. Only
//! the rate limiter, the heartbeat, or a supersede closes the socket.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Handler futures run under `catch_unwind`
//! - Socket errors end the connection and run the normal teardown

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::SplitSink;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use iob_core::{ApiKeyRecord, ConnectionId, SessionRecord};
use iob_protocol::{
    ClientRequest, CloseReason, ErrorBody, ErrorCode, Frame, HostRequest, InitializeClientReply,
    InitializeHostReply,
};

use crate::channel::{Channel, Outbound, RateVerdict, Role};
use crate::error::{BrokerError, BrokerResult};
use crate::liveness::spawn_heartbeat;
use crate::registry::{ClientEntry, Unregistered};

use super::AppState;

/// Length of one rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// How long the writer may take to flush after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Peers
// ============================================================================

struct HostPeer {
    api_key: ApiKeyRecord,
    /// Set once `INITIALIZE_HOST` succeeded on this socket.
    initialized: AtomicBool,
}

enum Peer {
    Host(HostPeer),
    Client(ClientEntry),
}

struct Connection {
    state: AppState,
    channel: Arc<Channel>,
    peer: Peer,
}

/// Closes a socket that failed authentication.
pub(super) async fn reject(mut socket: WebSocket, reason: CloseReason) {
    if let Err(e) = socket.send(close_message(&reason)).await {
        debug!(error = %e, "Failed to send rejection close frame");
    }
}

/// Runs an authenticated host socket until it closes.
pub(super) async fn run_host(
    socket: WebSocket,
    state: AppState,
    api_key: ApiKeyRecord,
    id: ConnectionId,
) {
    let (channel, outbound) = Channel::new(
        id,
        Role::Host,
        state.config.rate_limit.host,
        state.config.channel.outbound_buffer,
    );

    info!(
        connection_id = %channel.id(),
        organization_id = %api_key.organization_id,
        "Host connected"
    );

    let connection = Connection {
        state,
        channel,
        peer: Peer::Host(HostPeer {
            api_key,
            initialized: AtomicBool::new(false),
        }),
    };
    connection.run(socket, outbound).await;
}

/// Runs an authenticated client socket until it closes.
///
/// Clients are registered immediately; `INITIALIZE_CLIENT` only confirms
/// the session.
pub(super) async fn run_client(
    socket: WebSocket,
    state: AppState,
    session: SessionRecord,
    ghost: bool,
    id: ConnectionId,
) {
    let (channel, outbound) = Channel::new(
        id,
        Role::Client,
        state.config.rate_limit.client,
        state.config.channel.outbound_buffer,
    );

    let entry = ClientEntry {
        channel: Arc::clone(&channel),
        auth: session.auth_context(),
        ghost,
        connected_at: Utc::now(),
    };

    match state.registry.register_client(entry.clone()).await {
        Ok(superseded) => {
            if let Some(old) = superseded {
                state.pages.connection_gone(channel.id(), old.pages()).await;
            }
        }
        Err(e) => {
            warn!(connection_id = %channel.id(), error = %e, "Client registration failed");
            reject(socket, CloseReason::ServiceRestart).await;
            return;
        }
    }

    info!(
        connection_id = %channel.id(),
        user_id = %entry.auth.user_id,
        ghost,
        "Client connected"
    );

    let connection = Connection {
        state,
        channel,
        peer: Peer::Client(entry),
    };
    connection.run(socket, outbound).await;
}

impl Connection {
    fn id(&self) -> &ConnectionId {
        self.channel.id()
    }

    // ========================================================================
    // Socket loop
    // ========================================================================

    async fn run(self, socket: WebSocket, outbound: mpsc::Receiver<Outbound>) {
        let (sink, mut stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, outbound, Arc::clone(&self.channel)));
        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.channel),
            Arc::clone(&self.state.store),
            self.state.config.liveness.clone(),
        );
        let mut rate_tick = interval_at(Instant::now() + RATE_WINDOW, RATE_WINDOW);
        // Calls are handled inline; a long one must not leave a burst of
        // window ticks behind it.
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.channel.closed() => break,

                _ = rate_tick.tick() => {
                    let verdict = self.channel.tick_rate_window();
                    if !verdict.is_allowed() {
                        self.rate_limited(verdict);
                        break;
                    }
                }

                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.channel.mark_alive();
                            self.handle_text(text.as_str()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            self.channel.mark_alive();
                            match std::str::from_utf8(&data) {
                                Ok(text) => self.handle_text(text).await,
                                Err(_) => debug!(connection_id = %self.id(), "Non-UTF8 binary frame ignored"),
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => self.channel.mark_alive(),
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            debug!(connection_id = %self.id(), error = %e, "Socket read failed");
                            break;
                        }
                    }
                }
            }
        }

        self.channel.close(CloseReason::Normal);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
            debug!(connection_id = %self.id(), "Writer did not drain in time");
        }
        heartbeat.abort();

        self.teardown().await;
    }

    fn rate_limited(&self, verdict: RateVerdict) {
        warn!(
            connection_id = %self.id(),
            role = %self.channel.role(),
            verdict = ?verdict,
            "Rate limit exceeded"
        );
        self.channel.close(CloseReason::rate_limited());
    }

    async fn handle_text(&self, text: &str) {
        let received_at = Utc::now();

        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %self.id(), error = %e, "Malformed frame");
                return;
            }
        };

        let call_id = match &frame {
            Frame::Response { id, result, error } => {
                self.channel.resolve(*id, result.clone(), error.clone());
                return;
            }
            Frame::Call { id, .. } => Some(*id),
            Frame::Send { .. } => None,
        };

        let method = frame.method().unwrap_or("UNKNOWN").to_string();
        let verdict = self.channel.record_inbound(&method);
        if !verdict.is_allowed() {
            self.rate_limited(verdict);
            return;
        }

        let (Frame::Call { payload, .. } | Frame::Send { payload }) = frame else {
            return;
        };

        debug!(connection_id = %self.id(), method = %method, call_id, "Inbound message");

        let result = match AssertUnwindSafe(self.dispatch(payload, received_at))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(|e| e.to_body()),
            Err(_) => {
                warn!(connection_id = %self.id(), method = %method, "Handler panicked");
                Err(ErrorBody {
                    code: ErrorCode::Internal,
                    message: format!("internal error handling {method}"),
                })
            }
        };

        match (call_id, result) {
            (Some(id), result) => {
                self.channel.reply(id, result);
            }
            (None, Err(body)) => {
                debug!(
                    connection_id = %self.id(),
                    method = %method,
                    code = %body.code,
                    message = %body.message,
                    "Send failed"
                );
            }
            (None, Ok(_)) => {}
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn dispatch(&self, payload: Value, received_at: DateTime<Utc>) -> BrokerResult<Value> {
        match &self.peer {
            Peer::Host(host) => {
                let request: HostRequest = serde_json::from_value(payload)
                    .map_err(|e| BrokerError::Malformed(e.to_string()))?;
                self.dispatch_host(host, request, received_at).await
            }
            Peer::Client(client) => {
                let request: ClientRequest = serde_json::from_value(payload)
                    .map_err(|e| BrokerError::Malformed(e.to_string()))?;
                self.dispatch_client(client, request).await
            }
        }
    }

    async fn dispatch_host(
        &self,
        host: &HostPeer,
        request: HostRequest,
        received_at: DateTime<Utc>,
    ) -> BrokerResult<Value> {
        let state = &self.state;
        let id = self.id();

        if !matches!(request, HostRequest::InitializeHost(_))
            && !host.initialized.load(Ordering::Acquire)
        {
            return Err(BrokerError::Unsupported("host is not initialized".into()));
        }

        match request {
            HostRequest::InitializeHost(params) => {
                let registration = state
                    .registrar
                    .initialize(Arc::clone(&self.channel), &host.api_key, params, received_at)
                    .await?;

                if let Some(old) = &registration.superseded {
                    state.pages.connection_gone(id, old.pages()).await;
                }
                if matches!(registration.reply, InitializeHostReply::Success { .. }) {
                    host.initialized.store(true, Ordering::Release);
                }
                to_value(&registration.reply)
            }
            HostRequest::SendIoCall(params) => {
                state.transactions.send_io_call(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::SendLoadingCall(params) => {
                state.transactions.send_loading_state(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::SendLog(params) => {
                state.transactions.send_log(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::SendRedirect(params) => {
                state.transactions.send_redirect(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::MarkTransactionComplete(params) => {
                state.transactions.mark_complete(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::SendPage(params) => {
                state.pages.send_page(id, params).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::LeavePage(params) => {
                state.pages.leave_page(id, &params.page_key).await?;
                Ok(Value::Bool(true))
            }
            HostRequest::Notify(params) => {
                state
                    .transactions
                    .notify(&host.api_key.auth_context(), params)
                    .await?;
                Ok(Value::Bool(true))
            }
            HostRequest::BeginHostShutdown => {
                state.registrar.begin_shutdown(id).await?;
                Ok(Value::Bool(true))
            }
        }
    }

    async fn dispatch_client(
        &self,
        client: &ClientEntry,
        request: ClientRequest,
    ) -> BrokerResult<Value> {
        let state = &self.state;

        match request {
            ClientRequest::InitializeClient => to_value(&InitializeClientReply {
                connection_id: client.id().clone(),
                user_id: client.auth.user_id.clone(),
                organization_id: client.auth.organization_id.clone(),
            }),
            ClientRequest::RespondToIoCall(params) => {
                state.transactions.respond_to_io_call(client, params).await?;
                Ok(Value::Bool(true))
            }
            ClientRequest::ConnectToTransactionAsClient(target) => {
                state
                    .transactions
                    .connect_client(client, &target.transaction_id)
                    .await?;
                Ok(Value::Bool(true))
            }
            ClientRequest::LeaveTransaction(target) => {
                state
                    .transactions
                    .leave_transaction(client.id(), &target.transaction_id)
                    .await?;
                Ok(Value::Bool(true))
            }
            ClientRequest::CancelTransaction(target) => {
                state
                    .transactions
                    .cancel(client, &target.transaction_id)
                    .await?;
                Ok(Value::Bool(true))
            }
            ClientRequest::RequestPage(params) => {
                to_value(&state.pages.request_page(client, params).await?)
            }
            ClientRequest::LeavePage(params) => {
                state.pages.leave_page(client.id(), &params.page_key).await?;
                Ok(Value::Bool(true))
            }
            ClientRequest::Notify(params) => {
                state.transactions.notify(&client.auth, params).await?;
                Ok(Value::Bool(true))
            }
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Removes the socket from the registry and cleans up after it.
    ///
    /// Does nothing beyond logging if a newer socket with the same id has
    /// already replaced this one.
    async fn teardown(&self) {
        let state = &self.state;
        let id = self.id();

        let Some(gone) = state.registry.unregister(id.clone(), self.channel.serial()).await else {
            info!(
                connection_id = %id,
                role = %self.channel.role(),
                reason = ?self.channel.close_reason(),
                "Connection closed (not registered)"
            );
            return;
        };

        match &gone {
            Unregistered::Host { .. } => {
                state.registrar.disconnected(id).await;
                if let Err(e) = state.transactions.host_disconnected(id).await {
                    warn!(connection_id = %id, error = %e, "Failed to drop host transactions");
                }
            }
            Unregistered::Client { .. } => {
                if let Err(e) = state.transactions.client_disconnected(id).await {
                    warn!(connection_id = %id, error = %e, "Failed to detach client");
                }
            }
        }
        state.pages.connection_gone(id, gone.pages()).await;

        info!(
            connection_id = %id,
            role = %self.channel.role(),
            reason = ?self.channel.close_reason(),
            "Connection closed"
        );
    }
}

fn to_value<T: Serialize>(value: &T) -> BrokerResult<Value> {
    serde_json::to_value(value).map_err(|e| BrokerError::Malformed(e.to_string()))
}

fn close_message(reason: &CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: reason.code(),
        reason: reason.reason().to_string().into(),
    }))
}

// ============================================================================
// Writer
// ============================================================================

/// Drains the outbound queue into the socket.
///
/// Stops after writing a close frame, when the queue is closed, or when
/// the channel is closed and the queue is empty.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    channel: Arc<Channel>,
) {
    loop {
        let item = tokio::select! {
            biased;
            item = outbound.recv() => item,
            _ = channel.closed() => None,
        };

        let (message, last) = match item {
            Some(Outbound::Text(text)) => (Message::Text(text.into()), false),
            Some(Outbound::Ping) => (Message::Ping(Vec::new().into()), false),
            Some(Outbound::Close(reason)) => (close_message(&reason), true),
            None => {
                let reason = channel.close_reason().unwrap_or(CloseReason::Normal);
                (close_message(&reason), true)
            }
        };

        if let Err(e) = sink.send(message).await {
            debug!(connection_id = %channel.id(), error = %e, "Socket write failed");
            channel.close(CloseReason::Normal);
            break;
        }
        if last {
            break;
        }
    }

    let _ = sink.close().await;
}
