// Atomic operations: per-thread re-entrant scopes that journal page
// mutations through the WAL and guarantee all-or-nothing completion.

mod manager;
mod operation;
mod recovery;

pub use manager::{AtomicOperationsManager, AtomicScope};
pub use operation::AtomicOperation;
pub use recovery::{recover, RecoveryStats};
