//! Synchronization of CABS stores.
//!
//! Every store enumerates its refs in ascending order, so reconciling any
//! number of stores is a k-way merge: at each step the least head across all
//! streams is held by some stores (havers) and missing from the rest
//! (needers). The blob is read from one haver and written to every needer.
//! Anchor entries reconcile the same way, ordered by `(name, at)`.
//!
//! # Design Rules
//!
//! 1. Synchronization only ever adds; nothing is deleted or overwritten.
//! 2. A failure aborts the run with that error. Whatever was copied before
//!    stays copied, and rerunning picks up where the failure left off.

pub mod error;
pub mod synchronizer;
pub mod types;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{SyncError, SyncResult};
pub use synchronizer::{sync_all, sync_anchors, sync_stores};
pub use types::{StoreReport, SyncReport};
