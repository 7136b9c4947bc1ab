//! Deterministic binary serialization for kni wire structures.
//!
//! Everything that crosses the wire is bincode with a fixed configuration,
//! so the same value always produces the same bytes on every platform.

mod bincode_config;

pub use bincode_config::{deserialize, deserialize_bounded, serialize};
