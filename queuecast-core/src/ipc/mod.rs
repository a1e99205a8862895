//! Event types broadcast to observers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a UI binding
//! can forward them unchanged.

pub mod events;
