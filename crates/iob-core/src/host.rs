//! Durable host-instance records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApiKeyId, ConnectionId, Environment, OrganizationId};

/// Reachability of a host instance as last observed by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostInstanceStatus {
    Online,
    Unreachable,
    Offline,
    /// The host announced it is draining; heartbeats must not undo this.
    ShuttingDown,
}

/// SDK the host is built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkInfo {
    pub name: String,
    pub version: String,
}

/// Persisted record of one connected host process.
///
/// The id equals the connection id the host registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInstance {
    pub id: ConnectionId,
    pub api_key_id: ApiKeyId,
    pub organization_id: OrganizationId,
    pub environment: Environment,
    pub status: HostInstanceStatus,
    pub sdk: SdkInfo,
    pub created_at: DateTime<Utc>,
    /// Last time the broker heard from the host.
    pub updated_at: DateTime<Utc>,
}

impl HostInstance {
    /// Returns true if the host has not been heard from within `window`.
    pub fn untouched_for(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now - self.updated_at > window
    }
}
