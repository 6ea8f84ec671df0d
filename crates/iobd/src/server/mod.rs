//! HTTP/WebSocket server for the broker.
//!
//! The server:
//! - Accepts host sockets on `/ws/host` and client sockets on `/ws/client`
//! - Authenticates the upgrade request and spawns one connection task per socket
//! - Exposes `/health` and the `POST /transactions` entry point
//! - Runs the host-instance and dropped-transaction sweeps
//! - On shutdown, marks every host offline and closes every socket (1012)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  BrokerServer   │
//! │  axum::serve    │
//! └───────┬─────────┘
//!         │ upgrade
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │   Connection    │────▶│  RegistryHandle │
//! │ (per socket)    │     └─────────────────┘
//! │                 │     ┌─────────────────┐
//! │                 │────▶│ Transaction /   │──▶ Store, Notifier
//! └─────────────────┘     │ Page brokers    │
//!                         └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Authentication failures close the socket with 1008 after the upgrade
//! - A failing connection never affects other connections

mod auth;
mod connection;

pub use auth::{
    bearer_token, connection_id, session_cookie, CONNECTION_ID_HEADER, GHOST_HEADER,
    SESSION_COOKIE,
};

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use iob_core::{Notifier, Store, TransactionId};
use iob_protocol::{CloseReason, ErrorCode};

use crate::broker::{PageBroker, TransactionBroker};
use crate::config::BrokerConfig;
use crate::error::BrokerError;
use crate::host::{HostRegistrar, RegistrationError};
use crate::liveness::spawn_instance_sweeper;
use crate::registry::{spawn_registry, RegistryCounts, RegistryHandle};

// ============================================================================
// Shared state
// ============================================================================

/// Everything a connection task needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<BrokerConfig>,
    pub store: Arc<dyn Store>,
    pub registry: RegistryHandle,
    pub registrar: HostRegistrar,
    pub transactions: Arc<TransactionBroker>,
    pub pages: Arc<PageBroker>,
}

impl AppState {
    /// Wires the broker services together and starts the registry actor.
    ///
    /// # Errors
    ///
    /// `RegistrationError::InvalidMinimumVersion` if `min_sdk_version`
    /// does not parse.
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn Store>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, RegistrationError> {
        let registry = spawn_registry();
        let registrar = HostRegistrar::new(
            Arc::clone(&store),
            registry.clone(),
            &config.min_sdk_version,
            config.registration.clone(),
        )?;
        let transactions = Arc::new(TransactionBroker::new(
            Arc::clone(&store),
            notifier,
            registry.clone(),
            config.transactions.clone(),
            config.registration.clone(),
        ));
        let pages = Arc::new(PageBroker::new(
            Arc::clone(&store),
            registry.clone(),
            config.transactions.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            registrar,
            transactions,
            pages,
        })
    }

    /// Marks every connected host offline and closes every socket.
    pub async fn teardown(&self) {
        let hosts = self.registry.all_hosts().await;
        let clients = self.registry.all_clients().await;

        for host in &hosts {
            self.registrar.disconnected(host.id()).await;
            host.channel.close(CloseReason::ServiceRestart);
        }
        for client in &clients {
            client.channel.close(CloseReason::ServiceRestart);
        }

        info!(
            hosts = hosts.len(),
            clients = clients.len(),
            "Closed all connections for restart"
        );
    }
}

/// Builds the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/host", get(host_socket))
        .route("/ws/client", get(client_socket))
        .route("/transactions", post(start_transaction))
        .route("/health", get(health))
        .with_state(state)
}

// ============================================================================
// Server
// ============================================================================

pub struct BrokerServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl BrokerServer {
    pub fn new(state: AppState, cancel_token: CancellationToken) -> Self {
        Self {
            state,
            cancel_token,
        }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.state.config.listen;
        TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr,
            error: e.to_string(),
        })
    }

    /// Binds and serves until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves on `listener` until the cancellation token fires, then
    /// tears down every connection.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::Serve(e.to_string()))?;
        info!(listen = %local, "Broker listening");

        let sweeps = self.cancel_token.child_token();
        let instance_sweeper = spawn_instance_sweeper(
            Arc::clone(&self.state.store),
            self.state.config.liveness.clone(),
            sweeps.clone(),
        );
        let transaction_sweeper =
            Arc::clone(&self.state.transactions).spawn_sweeper(sweeps.clone());

        let shutdown_state = self.state.clone();
        let token = self.cancel_token.clone();
        let result = axum::serve(listener, router(self.state.clone()))
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                info!("Server shutdown requested");
                shutdown_state.teardown().await;
            })
            .await
            .map_err(|e| ServerError::Serve(e.to_string()));

        sweeps.cancel();
        let _ = instance_sweeper.await;
        let _ = transaction_sweeper.await;

        info!("Server stopped");
        result
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn host_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let ws = ws.max_message_size(state.config.channel.max_message_bytes);

    match auth::authenticate_host(state.store.as_ref(), &headers).await {
        Ok(api_key) => {
            let id = auth::connection_id(&headers);
            ws.on_upgrade(move |socket| connection::run_host(socket, state, api_key, id))
        }
        Err(e) => {
            warn!(error = %e, "Host authentication failed");
            ws.on_upgrade(|socket| connection::reject(socket, CloseReason::unauthorized()))
        }
    }
}

async fn client_socket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let ws = ws.max_message_size(state.config.channel.max_message_bytes);

    match auth::authenticate_client(state.store.as_ref(), &headers).await {
        Ok((session, ghost)) => {
            let id = auth::connection_id(&headers);
            ws.on_upgrade(move |socket| connection::run_client(socket, state, session, ghost, id))
        }
        Err(e) => {
            warn!(error = %e, "Client authentication failed");
            ws.on_upgrade(|socket| connection::reject(socket, CloseReason::unauthorized()))
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    connections: RegistryCounts,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Response {
    if !state.registry.is_connected() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    Json(HealthResponse {
        status: "ok",
        connections: state.registry.counts().await,
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
struct StartTransactionRequest {
    action_slug: String,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StartTransactionResponse {
    transaction_id: TransactionId,
}

/// POST /transactions, authenticated like a client.
async fn start_transaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartTransactionRequest>,
) -> Result<Json<StartTransactionResponse>, BrokerError> {
    let (session, _ghost) = auth::authenticate_client(state.store.as_ref(), &headers).await?;
    let transaction_id = state
        .transactions
        .start_transaction(&session.auth_context(), &request.action_slug, request.params)
        .await?;
    Ok(Json(StartTransactionResponse { transaction_id }))
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match self.code() {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::Malformed | ErrorCode::Unsupported => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidTransition => StatusCode::CONFLICT,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self.to_body())).into_response()
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: String },

    #[error("server error: {0}")]
    Serve(String),
}
