//! CLI command implementations.

pub mod dump_deltas;
pub mod inspect;
pub mod requeue;
pub mod snapshot;
pub mod verify;
