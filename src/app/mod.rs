//! Application Core (C8): the event loop, lifecycle flags, wake scheduler,
//! and module-registration surface tying every other subsystem together.

pub mod core;
pub mod flags;
pub mod module;
pub mod waker;

pub use core::{
    AppCore, ConnectionCallback, DiscoveryCallback, ForwardRequestCallback, ForwardResponseCallback,
    SendTarget, TickTimer, TopologyCallback,
};
pub use flags::Flags;
pub use module::Module;
pub use waker::WakeQueue;
