//! Application Core lifecycle flags (part of C8): an atomic bitmask guarding
//! re-entrant `init`/`run`/`stop`/`tick` calls with compare-and-swap instead
//! of a lock. `InCallback`/`InTick` guard re-entrancy directly, distinct from
//! the `RwLock`s sprinkled through this crate for `Send`-ness.

use std::sync::atomic::{AtomicU32, Ordering};

pub const RUNNING: u32 = 1 << 0;
pub const STOPPING: u32 = 1 << 1;
pub const TIMED_OUT: u32 = 1 << 2;
pub const IN_CALLBACK: u32 = 1 << 3;
pub const INITIALIZED: u32 = 1 << 4;
pub const INITIALIZING: u32 = 1 << 5;
pub const STOPPED: u32 = 1 << 6;
pub const IN_TICK: u32 = 1 << 7;
pub const DESTROYING: u32 = 1 << 8;
/// Operator flag, not a lifecycle state: set once at construction to force
/// `send_message`'s bus-fallback branch to always return `NODE_NOT_FOUND`.
pub const DISABLE_BUS_FALLBACK: u32 = 1 << 9;

#[derive(Debug, Default)]
pub struct Flags(AtomicU32);

impl Flags {
    pub fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn contains(&self, bits: u32) -> bool {
        self.0.load(Ordering::Acquire) & bits == bits
    }

    pub fn set(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear(&self, bits: u32) {
        self.0.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Atomically sets `bit` only if none of `forbidden` is currently set;
    /// returns `false` (without setting anything) on conflict. This is the
    /// re-entrancy guard for `init`/`run`/`stop`/`tick`.
    pub fn try_enter(&self, bit: u32, forbidden: u32) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if current & forbidden != 0 {
                return false;
            }
            match self.0.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }
}
