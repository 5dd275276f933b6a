//! Discovery Set (C4): the in-memory peer index and its consistent-hash ring.

pub mod ring;
pub mod set;

pub use ring::{ConsistentHashRing, SearchMode};
pub use set::DiscoverySet;
