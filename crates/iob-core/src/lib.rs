//! iob Core - Shared domain types for the io broker
//!
//! This crate provides the domain model shared between the wire
//! protocol (`iob-protocol`) and the broker daemon (`iobd`):
//! identifiers, the transaction state machine, host instances, the
//! action/page catalog, and the narrow traits through which the broker
//! talks to its persistent store and notifier.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod auth;
pub mod catalog;
pub mod error;
pub mod host;
pub mod ids;
pub mod notify;
pub mod resumable;
pub mod store;
pub mod transaction;

// Re-exports for convenience
pub use auth::{ApiKeyRecord, AuthContext, Environment, SessionRecord};
pub use catalog::{is_valid_slug, CatalogEntry, CatalogKind, MAX_SLUG_LEN};
pub use error::{DomainError, DomainResult};
pub use host::{HostInstance, HostInstanceStatus, SdkInfo};
pub use ids::{
    ApiKeyId, ConnectionId, InputGroupKey, OrganizationId, PageKey, TransactionId, UserId,
};
pub use notify::{Delivery, DeliveryMethod, Notification, NotificationKind, Notifier, NotifyError};
pub use resumable::{ResumableKind, ResumableState};
pub use store::{Store, StoreError, StoreResult, TransactionFilter};
pub use transaction::{ResultStatus, Transaction, TransactionResult, TransactionStatus};
