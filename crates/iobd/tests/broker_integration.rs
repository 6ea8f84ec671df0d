//! Integration tests for the broker services without sockets.
//!
//! Hosts and clients are plain channels registered through the real
//! handshake and registry, so these tests cover the wiring between
//! `HostRegistrar`, `TransactionBroker`, `PageBroker` and the store.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use iob_core::{
    ApiKeyId, ApiKeyRecord, AuthContext, ConnectionId, Environment, HostInstanceStatus,
    OrganizationId, SessionRecord, Store, TransactionId, TransactionStatus, UserId,
};
use iob_protocol::{
    ActionDefinition, Frame, InitializeHostParams, InitializeHostReply, PageDefinition,
    RequestPageParams, SendIoCallParams,
};
use iobd::channel::{Channel, Outbound, Role};
use iobd::config::RateLimits;
use iobd::liveness::sweep_host_instances;
use iobd::notifier::TracingNotifier;
use iobd::registry::ClientEntry;
use iobd::store::MemoryStore;
use iobd::{AppState, BrokerConfig};

// ============================================================================
// Test Helpers
// ============================================================================

fn api_key() -> ApiKeyRecord {
    ApiKeyRecord {
        id: ApiKeyId::new("key-1"),
        user_id: UserId::new("dev"),
        organization_id: OrganizationId::new("org-1"),
        environment: Environment::Production,
    }
}

fn alice() -> SessionRecord {
    SessionRecord {
        user_id: UserId::new("alice"),
        organization_id: OrganizationId::new("org-1"),
        environment: Environment::Production,
        ghost: false,
    }
}

fn state() -> AppState {
    AppState::new(
        BrokerConfig::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(TracingNotifier),
    )
    .expect("build state")
}

/// Runs the handshake for a host declaring `update_user` and `dashboard`.
async fn connect_host(state: &AppState, id: &str) -> mpsc::Receiver<Outbound> {
    let (channel, rx) = Channel::new(
        ConnectionId::new(id),
        Role::Host,
        RateLimits::default().host,
        64,
    );
    let registration = state
        .registrar
        .initialize(
            channel,
            &api_key(),
            InitializeHostParams {
                sdk_name: "@iob/sdk".to_string(),
                sdk_version: "0.25.0".to_string(),
                actions: vec![ActionDefinition {
                    slug: "update_user".to_string(),
                    name: None,
                    description: None,
                    backgroundable: false,
                }],
                pages: vec![PageDefinition {
                    slug: "dashboard".to_string(),
                    name: None,
                    description: None,
                }],
            },
            Utc::now(),
        )
        .await
        .expect("initialize");
    assert!(matches!(
        registration.reply,
        InitializeHostReply::Success { .. }
    ));
    rx
}

async fn connect_client(state: &AppState, id: &str) -> (ClientEntry, mpsc::Receiver<Outbound>) {
    let (channel, rx) = Channel::new(
        ConnectionId::new(id),
        Role::Client,
        RateLimits::default().client,
        64,
    );
    let session = alice();
    let entry = ClientEntry {
        channel,
        auth: session.auth_context(),
        ghost: false,
        connected_at: Utc::now(),
    };
    state.registry.register_client(entry.clone()).await.unwrap();
    (entry, rx)
}

/// Every call/send payload queued so far.
fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        if let Outbound::Text(text) = item {
            if let Ok(Frame::Call { payload, .. } | Frame::Send { payload }) = Frame::decode(&text)
            {
                out.push(payload);
            }
        }
    }
    out
}

fn methods(payloads: &[Value]) -> Vec<&str> {
    payloads
        .iter()
        .filter_map(|p| p["method"].as_str())
        .collect()
}

async fn start(state: &AppState, auth: &AuthContext) -> TransactionId {
    state
        .transactions
        .start_transaction(auth, "update_user", None)
        .await
        .expect("start transaction")
}

fn render(key: &str) -> Value {
    json!({
        "inputGroupKey": key,
        "toRender": [{"methodName": "INPUT_TEXT", "label": "Name"}]
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_abandoned_transaction_is_canceled_once() {
    let state = state();
    let mut host_rx = connect_host(&state, "host-1").await;
    let (client, _client_rx) = connect_client(&state, "client-1").await;

    let tx_id = start(&state, &client.auth).await;
    state.transactions.connect_client(&client, &tx_id).await.unwrap();
    state
        .transactions
        .send_io_call(
            &ConnectionId::new("host-1"),
            SendIoCallParams {
                transaction_id: tx_id.clone(),
                io_call: render("step-1"),
            },
        )
        .await
        .unwrap();

    state.registry.unregister(client.id().clone(), client.channel.serial()).await;
    state.transactions.client_disconnected(client.id()).await.unwrap();
    drain(&mut host_rx);

    let tx = state.store.transaction(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::ClientConnectionDropped);

    let later = Utc::now() + TimeDelta::hours(1);
    let canceled = state.transactions.sweep_dropped(later).await.unwrap();
    assert_eq!(canceled, vec![tx_id.clone()]);
    assert!(state.transactions.sweep_dropped(later).await.unwrap().is_empty());

    let sent = drain(&mut host_rx);
    assert_eq!(methods(&sent), vec!["IO_RESPONSE"]);
    assert_eq!(sent[0]["params"]["kind"], "CANCELED");

    let tx = state.store.transaction(&tx_id).await.unwrap().unwrap();
    assert_eq!(tx.status, TransactionStatus::Completed);
}

#[tokio::test]
async fn test_reconnecting_client_gets_pending_render() {
    let state = state();
    let _host_rx = connect_host(&state, "host-1").await;
    let (first, _first_rx) = connect_client(&state, "client-1").await;

    let tx_id = start(&state, &first.auth).await;
    state.transactions.connect_client(&first, &tx_id).await.unwrap();
    state
        .transactions
        .send_io_call(
            &ConnectionId::new("host-1"),
            SendIoCallParams {
                transaction_id: tx_id.clone(),
                io_call: render("step-1"),
            },
        )
        .await
        .unwrap();

    state.registry.unregister(first.id().clone(), first.channel.serial()).await;
    state.transactions.client_disconnected(first.id()).await.unwrap();

    let (second, mut second_rx) = connect_client(&state, "client-2").await;
    state.transactions.connect_client(&second, &tx_id).await.unwrap();

    let sent = drain(&mut second_rx);
    assert_eq!(methods(&sent), vec!["RENDER"]);
    assert_eq!(sent[0]["params"]["io_call"]["inputGroupKey"], "step-1");
}

#[tokio::test]
async fn test_host_teardown_marks_instance_offline_and_closes_pages() {
    let state = state();
    let mut host_rx = connect_host(&state, "host-1").await;
    let (client, mut client_rx) = connect_client(&state, "client-1").await;

    let host = state
        .registry
        .lookup_host(&ConnectionId::new("host-1"))
        .await
        .unwrap();
    let pages = Arc::clone(&state.pages);
    let page_client = client.clone();
    let request = tokio::spawn(async move {
        pages
            .request_page(
                &page_client,
                RequestPageParams {
                    page_slug: "dashboard".to_string(),
                    params: None,
                },
            )
            .await
    });

    let open_id = loop {
        let Some(Outbound::Text(text)) = host_rx.recv().await else {
            continue;
        };
        if let Ok(Frame::Call { id, .. }) = Frame::decode(&text) {
            break id;
        }
    };
    host.channel.resolve(open_id, Some(json!(null)), None);
    let reply = request.await.unwrap().unwrap();
    assert!(state.registry.page_session(&reply.page_key).await.is_some());

    let gone = state
        .registry
        .unregister(host.id().clone(), host.channel.serial())
        .await
        .unwrap();
    state.registrar.disconnected(host.id()).await;
    state.pages.connection_gone(host.id(), gone.pages()).await;

    assert_eq!(methods(&drain(&mut client_rx)), vec!["CLOSE_PAGE"]);
    let instance = state
        .store
        .host_instance(host.id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, HostInstanceStatus::Offline);
}

#[tokio::test]
async fn test_stale_instances_are_swept() {
    let state = state();
    let _host_rx = connect_host(&state, "host-1").await;
    let config = state.config.liveness.clone();

    let soon = Utc::now() + TimeDelta::seconds(config.host_unreachable_secs as i64 + 1);
    let report = sweep_host_instances(state.store.as_ref(), &config, soon)
        .await
        .unwrap();
    assert_eq!(report.marked_unreachable, vec![ConnectionId::new("host-1")]);

    let much_later = soon + TimeDelta::seconds(config.instance_retention_secs as i64 + 1);
    let report = sweep_host_instances(state.store.as_ref(), &config, much_later)
        .await
        .unwrap();
    assert_eq!(report.deleted, vec![ConnectionId::new("host-1")]);
}
