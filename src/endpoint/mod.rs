//! Endpoint/connection manager (C5): maps discovery records to logical
//! endpoints, binds handles to concrete transports, and buffers pending
//! messages across reconnects.

pub mod endpoint;
pub mod handle;

pub use endpoint::{Endpoint, PendingMessage, RetryOutcome};
pub use handle::{ConnectionHandle, PrivateData, TransportSender};
