//! Registry Client subsystem (C1-C3): etcd v3 HTTP gateway access, lease
//! keepalive, and watch streaming.

pub mod client;
pub mod framing;
pub mod keepalive;
pub mod watch;
pub mod wire;

pub use client::RegistryClient;
pub use keepalive::{Checker, KeepaliveHandle, KeepaliveRecord, KeepaliveState};
pub use watch::{WatchNotification, WatchState, WatchStream};
