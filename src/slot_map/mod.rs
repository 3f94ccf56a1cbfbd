//! Shared slot map
//!
//! The index every cooperating process consults to find which slot of a
//! backend's database file holds a key, and to lock that slot for reading
//! or writing. The map lives in a memory-mapped file so that independent
//! processes attaching to the same path see the same anchors.

mod anchor;
mod map;

pub use map::{AnchorView, MapStats, SlotMap, DEFAULT_PROBE_LIMIT};
