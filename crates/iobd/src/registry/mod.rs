//! Connection registry using the Actor pattern.
//!
//! The registry is the in-memory routing table of the broker: which host
//! and client sockets are live on this process, and which page sessions
//! pair them. It receives commands via a tokio mpsc channel; nothing else
//! touches its maps.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────────┐
//! │ Connection task │────▶│  RegistryActor  │────▶│ HashMap<ConnectionId,│
//! │ / brokers       │     │                 │     │   HostEntry/Client>  │
//! └─────────────────┘     └─────────────────┘     └──────────────────────┘
//!         │                       │
//!         │   RegistryCommand     │   Superseded sockets are closed
//!         │   (mpsc channel)      │   here, with close code 1008
//!         ▼                       ▼
//!   register / lookup       page sessions torn down with
//!   unregister(serial)      either side
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use commands::{
    ClientEntry, HostEntry, PageSession, RegistryCommand, RegistryCounts, RegistryError,
    Unregistered,
};
pub use handle::RegistryHandle;

/// Channel buffer size
const COMMAND_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// # Example
///
/// ```no_run
/// use iobd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry();
///     let counts = handle.counts().await;
///     assert_eq!(counts.hosts, 0);
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);

    let actor = RegistryActor::new(cmd_rx);
    tokio::spawn(actor.run());

    RegistryHandle::new(cmd_tx)
}
