//! Notifier interface for best-effort async delivery.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Environment, OrganizationId, TransactionId, UserId};

/// Channel a notification goes out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Email,
    Slack,
}

/// One recipient of a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub method: DeliveryMethod,
    pub to: String,
}

/// Why a notification is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    /// A transaction wants input and no client is attached.
    AwaitingInput,
    /// A transaction finished while no client was attached.
    Completed,
    /// Explicit NOTIFY call from a host or client.
    Custom,
}

/// A notification handed to the notifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub organization_id: OrganizationId,
    pub environment: Environment,
    /// Default recipient when `deliveries` is empty.
    pub user_id: Option<UserId>,
    pub transaction_id: Option<TransactionId>,
    pub title: Option<String>,
    pub message: String,
    pub deliveries: Vec<Delivery>,
}

/// Errors surfaced by a notifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification rejected: {0}")]
    Rejected(String),

    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Best-effort delivery of notifications when no client is attached.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}
