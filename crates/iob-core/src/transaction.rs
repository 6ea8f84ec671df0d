//! Transaction record and its status state machine.
//!
//! ```text
//!             attach / first render
//!   PENDING ─────────────────────────▶ RUNNING ◀──────────────┐
//!                                        │  ▲                 │ respond
//!                      interactive render│  │                 │
//!                                        ▼  │                 │
//!                                  AWAITING_INPUT ────────────┘
//!
//!   RUNNING | AWAITING_INPUT | HOST_CONNECTION_DROPPED
//!       ── client lost ──▶ CLIENT_CONNECTION_DROPPED
//!   CLIENT_CONNECTION_DROPPED ── takeover ───▶ (status before the drop)
//!   unfinished ── host lost ──▶ HOST_CONNECTION_DROPPED ── render ──▶ resumed
//!
//! A host loss while a client drop is pending does not leave
//! CLIENT_CONNECTION_DROPPED; it is recorded as the status to restore so
//! the grace sweep still applies.
//!   any non-terminal ── complete / cancel / sweep ──▶ COMPLETED (terminal)
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    ConnectionId, DomainError, DomainResult, Environment, InputGroupKey, OrganizationId,
    TransactionId, UserId,
};

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Running,
    AwaitingInput,
    ClientConnectionDropped,
    HostConnectionDropped,
    Completed,
}

impl TransactionStatus {
    /// Returns true once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Returns true for the states a running action can be in.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Running | Self::AwaitingInput)
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// Re-entering RUNNING or AWAITING_INPUT from itself is allowed: a
    /// host may render several steps in a row.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;

        match (self, next) {
            (Completed, _) => false,
            (_, Completed) => true,
            (Pending, Running) => true,
            (Running | AwaitingInput, Running | AwaitingInput) => true,
            (Running | AwaitingInput | HostConnectionDropped, ClientConnectionDropped) => true,
            (ClientConnectionDropped, Running | AwaitingInput) => true,
            (
                Pending | Running | AwaitingInput | ClientConnectionDropped,
                HostConnectionDropped,
            ) => true,
            (HostConnectionDropped, Running | AwaitingInput) => true,
            _ => false,
        }
    }

    /// Wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::AwaitingInput => "AWAITING_INPUT",
            Self::ClientConnectionDropped => "CLIENT_CONNECTION_DROPPED",
            Self::HostConnectionDropped => "HOST_CONNECTION_DROPPED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a completed transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failure,
    Canceled,
}

/// Terminal outcome reported by the host (or imposed by the broker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl TransactionResult {
    /// Result used when the broker cancels a transaction.
    pub fn canceled() -> Self {
        Self {
            status: ResultStatus::Canceled,
            data: None,
        }
    }
}

/// Durable record of one action run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub action_slug: String,
    pub organization_id: OrganizationId,
    pub environment: Environment,
    pub status: TransactionStatus,
    /// Host instance the action runs on (equals its connection id).
    pub host_instance_id: ConnectionId,
    pub owner_id: UserId,
    /// Client connection currently driving the transaction, if any.
    pub current_client_id: Option<ConnectionId>,
    /// Input-group key of the last render, used to detect re-delivery.
    pub last_input_group_key: Option<InputGroupKey>,
    /// Copied from the catalog entry when the transaction starts.
    pub backgroundable: bool,
    /// Status to restore when a client takes over after a drop.
    pub resume_status: Option<TransactionStatus>,
    pub dropped_at: Option<DateTime<Utc>>,
    pub result: Option<TransactionResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Creates a PENDING transaction.
    pub fn new(
        id: TransactionId,
        action_slug: impl Into<String>,
        organization_id: OrganizationId,
        environment: Environment,
        host_instance_id: ConnectionId,
        owner_id: UserId,
        backgroundable: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            action_slug: action_slug.into(),
            organization_id,
            environment,
            status: TransactionStatus::Pending,
            host_instance_id,
            owner_id,
            current_client_id: None,
            last_input_group_key: None,
            backgroundable,
            resume_status: None,
            dropped_at: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::InvalidTransition {
                transaction_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Applies a render: PENDING is first promoted to RUNNING, then the
    /// transaction lands in AWAITING_INPUT when the render is interactive.
    ///
    /// A render while a client drop is pending only updates the status to
    /// restore on takeover.
    pub fn apply_render(&mut self, interactive: bool, now: DateTime<Utc>) -> DomainResult<()> {
        let target = if interactive {
            TransactionStatus::AwaitingInput
        } else {
            TransactionStatus::Running
        };

        match self.status {
            TransactionStatus::ClientConnectionDropped => {
                self.resume_status = Some(target);
                self.updated_at = now;
                Ok(())
            }
            TransactionStatus::Pending => {
                self.transition(TransactionStatus::Running, now)?;
                self.transition(target, now)
            }
            _ => self.transition(target, now),
        }
    }

    /// Records that the current client went away.
    pub fn drop_client(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        let previous = self.status;
        self.transition(TransactionStatus::ClientConnectionDropped, now)?;
        self.resume_status = Some(previous);
        self.dropped_at = Some(now);
        self.current_client_id = None;
        Ok(())
    }

    /// Records that the host went away.
    ///
    /// While a client drop is pending the status stays put and only the
    /// status to restore changes.
    pub fn drop_host(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == TransactionStatus::ClientConnectionDropped {
            self.resume_status = Some(TransactionStatus::HostConnectionDropped);
            self.updated_at = now;
            return Ok(());
        }
        self.transition(TransactionStatus::HostConnectionDropped, now)
    }

    /// Restores the status recorded by [`Transaction::drop_client`].
    pub fn resume_client(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        let target = self.resume_status.unwrap_or(TransactionStatus::Running);
        self.transition(target, now)?;
        self.resume_status = None;
        self.dropped_at = None;
        Ok(())
    }

    /// Finalizes the transaction.
    pub fn complete(&mut self, result: TransactionResult, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(TransactionStatus::Completed, now)?;
        self.result = Some(result);
        self.resume_status = None;
        self.dropped_at = None;
        Ok(())
    }

    /// Returns true if the transaction has sat in CLIENT_CONNECTION_DROPPED
    /// for longer than `grace`.
    pub fn is_drop_expired(&self, grace: Duration, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::ClientConnectionDropped
            && self.dropped_at.is_some_and(|at| now - at > grace)
    }
}
