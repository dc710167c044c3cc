//! Bounded parallel execution and per-entity advisory locking.

pub mod locks;
pub mod pool;

pub use locks::{ContextStore, EntityKind, FieldValue, Resolution, UpdateOutcome};
pub use pool::{CancelFlag, run_bounded};
