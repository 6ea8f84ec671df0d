//! Routing between hosts and clients.
//!
//! - [`TransactionBroker`]: action runs and their render/response relay
//! - [`PageBroker`]: page sessions

mod page;
mod transaction;

pub use page::PageBroker;
pub use transaction::TransactionBroker;
