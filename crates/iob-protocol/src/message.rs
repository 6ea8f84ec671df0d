//! Protocol message types, one closed enum per direction.
//!
//! Payloads are adjacently tagged:
//! `{"method": "SEND_IO_CALL", "params": {...}}`.

use iob_core::{
    AuthContext, ConnectionId, Delivery, OrganizationId, PageKey, ResultStatus, TransactionId,
    TransactionResult, TransactionStatus, UserId,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Host -> broker
// ============================================================================

/// Messages a host sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostRequest {
    /// Authenticate the SDK and declare the host's catalog.
    InitializeHost(InitializeHostParams),

    /// Deliver a render instruction for a transaction.
    SendIoCall(SendIoCallParams),

    /// Update the loading indicator of a transaction.
    SendLoadingCall(LoadingParams),

    /// Append a log line to a transaction.
    SendLog(LogParams),

    /// Ask the client to navigate elsewhere.
    SendRedirect(RedirectParams),

    /// Finalize a transaction.
    MarkTransactionComplete(CompleteParams),

    /// Render a page for its client.
    SendPage(SendPageParams),

    /// Close a page from the host side.
    LeavePage(LeavePageParams),

    /// Trigger an out-of-band notification.
    Notify(NotifyParams),

    /// The host is draining and will disconnect soon.
    BeginHostShutdown,
}

/// A callable action declared by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub backgroundable: bool,
}

/// A page declared by a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageDefinition {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeHostParams {
    pub sdk_name: String,
    pub sdk_version: String,
    #[serde(default)]
    pub actions: Vec<ActionDefinition>,
    #[serde(default)]
    pub pages: Vec<PageDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendIoCallParams {
    pub transaction_id: TransactionId,
    /// Render instruction, relayed to the client verbatim.
    pub io_call: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadingParams {
    pub transaction_id: TransactionId,
    pub state: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogParams {
    pub transaction_id: TransactionId,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectParams {
    pub transaction_id: TransactionId,
    pub redirect: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteParams {
    pub transaction_id: TransactionId,
    pub result: TransactionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPageParams {
    pub page_key: PageKey,
    pub page: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeavePageParams {
    pub page_key: PageKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub message: String,
    #[serde(default)]
    pub deliveries: Vec<Delivery>,
}

/// Structured hint telling an outdated host to upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkAlert {
    pub minimum_version: String,
    pub message: String,
}

/// Reply to `INITIALIZE_HOST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InitializeHostReply {
    Success {
        connection_id: ConnectionId,
        organization_id: OrganizationId,
        /// Declared slugs that failed validation and were ignored.
        #[serde(default)]
        invalid_slugs: Vec<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sdk_alert: Option<SdkAlert>,
    },
}

// ============================================================================
// Client -> broker
// ============================================================================

/// Messages a dashboard client sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRequest {
    /// Confirm the session and learn the assigned connection id.
    InitializeClient,

    /// Deliver the user's response to the pending render.
    RespondToIoCall(RespondParams),

    /// Attach to a transaction, taking it over from any prior client.
    ConnectToTransactionAsClient(TransactionRef),

    /// Detach from a transaction.
    LeaveTransaction(TransactionRef),

    /// Cancel a transaction the user owns.
    CancelTransaction(TransactionRef),

    /// Open a page session.
    RequestPage(RequestPageParams),

    /// Close a page session.
    LeavePage(LeavePageParams),

    /// Trigger an out-of-band notification.
    Notify(NotifyParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionRef {
    pub transaction_id: TransactionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespondParams {
    pub transaction_id: TransactionId,
    pub io_response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPageParams {
    pub page_slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Reply to `INITIALIZE_CLIENT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeClientReply {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    pub organization_id: OrganizationId,
}

/// Reply to `REQUEST_PAGE`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPageReply {
    pub page_key: PageKey,
}

// ============================================================================
// Broker -> host
// ============================================================================

/// Messages the broker sends to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostCommand {
    /// Run an action.
    StartTransaction(StartTransactionParams),

    /// Result of the pending render (or its cancellation).
    IoResponse(IoResponseParams),

    /// Open a page on behalf of a user.
    OpenPage(OpenPageParams),

    /// The page's client went away.
    ClosePage(ClosePageParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTransactionParams {
    pub transaction_id: TransactionId,
    pub action_slug: String,
    pub user: AuthContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// How the host should treat its last pending render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoResponseKind {
    Return,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoResponseParams {
    pub transaction_id: TransactionId,
    pub kind: IoResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPageParams {
    pub page_key: PageKey,
    pub page_slug: String,
    pub user: AuthContext,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosePageParams {
    pub page_key: PageKey,
}

// ============================================================================
// Broker -> client
// ============================================================================

/// Messages the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    Render(RenderParams),
    RenderPage(RenderPageParams),
    LoadingState(LoadingParams),
    Log(LogParams),
    Redirect(RedirectParams),

    /// Another client took over the transaction.
    ClientUsurped(TransactionRef),

    /// The transaction's host disconnected before finishing.
    HostClosedUnexpectedly(TransactionRef),

    TransactionCompleted(TransactionCompletedParams),

    /// The page's host went away or closed it.
    ClosePage(ClosePageParams),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub transaction_id: TransactionId,
    pub io_call: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPageParams {
    pub page_key: PageKey,
    pub page: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionCompletedParams {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
    pub result_status: ResultStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_request_wire_names() {
        let msg = HostRequest::SendLog(LogParams {
            transaction_id: TransactionId::new("tx-1"),
            data: "hello".to_string(),
            index: Some(0),
            timestamp: None,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["method"], "SEND_LOG");
        assert_eq!(value["params"]["data"], "hello");
    }

    #[test]
    fn test_client_request_connect_parses() {
        let value = json!({
            "method": "CONNECT_TO_TRANSACTION_AS_CLIENT",
            "params": {"transaction_id": "tx-9"}
        });
        let msg: ClientRequest = serde_json::from_value(value).unwrap();
        assert_eq!(
            msg,
            ClientRequest::ConnectToTransactionAsClient(TransactionRef {
                transaction_id: TransactionId::new("tx-9")
            })
        );
    }

    #[test]
    fn test_initialize_host_defaults() {
        let value = json!({
            "method": "INITIALIZE_HOST",
            "params": {
                "sdk_name": "@iob/sdk",
                "sdk_version": "0.21.0",
                "actions": [{"slug": "update_user"}]
            }
        });
        let msg: HostRequest = serde_json::from_value(value).unwrap();
        match msg {
            HostRequest::InitializeHost(params) => {
                assert_eq!(params.actions.len(), 1);
                assert!(!params.actions[0].backgroundable);
                assert!(params.pages.is_empty());
            }
            other => panic!("Expected InitializeHost, got {other:?}"),
        }
    }

    #[test]
    fn test_initialize_host_reply_tags() {
        let reply = InitializeHostReply::Error {
            message: "too old".to_string(),
            sdk_alert: Some(SdkAlert {
                minimum_version: "0.20.0".to_string(),
                message: "upgrade".to_string(),
            }),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["sdk_alert"]["minimum_version"], "0.20.0");
    }

    #[test]
    fn test_io_response_kind_names() {
        let value = serde_json::to_value(IoResponseKind::Canceled).unwrap();
        assert_eq!(value, json!("CANCELED"));
    }
}
