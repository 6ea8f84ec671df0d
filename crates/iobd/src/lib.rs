//! iob daemon - connection broker between action hosts and dashboard clients
//!
//! This crate provides the broker's runtime:
//! - `registry` - Actor owning every live host, client and page session
//! - `channel` - Per-socket outbound queue, call correlation and liveness
//! - `host` - Host handshake, catalog registration and offline handling
//! - `broker` - Transaction lifecycle and page session relays
//! - `liveness` - Heartbeats and the stale host-instance sweep
//! - `server` - axum WebSocket endpoints and the connection driver
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        iobd daemon                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  BrokerServer   │────▶│      RegistryActor          │   │
//! │  │ (axum, /ws/*)   │     │ (hosts, clients, pages)     │   │
//! │  └────────┬────────┘     └──────────────▲──────────────┘   │
//! │           │                             │                   │
//! │           │ sockets                     │ lookups           │
//! │           ▼                             │                   │
//! │  ┌─────────────────┐     ┌──────────────┴──────────────┐   │
//! │  │   Connection    │────▶│ HostRegistrar / Transaction │   │
//! │  │ (per socket)    │     │ Broker / PageBroker         │   │
//! │  └─────────────────┘     └──────────────┬──────────────┘   │
//! │                                         │                   │
//! │                                         ▼                   │
//! │                               Store, Notifier (traits)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully
//! - A panic inside a call handler is caught and answered with `INTERNAL`

pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod host;
pub mod liveness;
pub mod notifier;
pub mod registry;
pub mod server;
pub mod store;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::BrokerConfig;
pub use error::{BrokerError, BrokerResult};
pub use server::{AppState, BrokerServer, ServerError};
