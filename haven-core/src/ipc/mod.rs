//! Types published over the engine event bus.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them to a UI process without re-mapping.

pub mod events;
