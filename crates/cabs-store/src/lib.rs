//! Blob-store and anchor contracts for CABS.
//!
//! A blob store maps the SHA-256 of every blob it holds back to the blob.
//! On top of that immutable layer, anchors give mutable names a timestamped
//! history: "the thing called `hello.txt` as of yesterday" resolves to one
//! specific ref.
//!
//! # Contracts
//!
//! - [`BlobStore`] -- get / put / ordered enumeration, plus capability probes
//! - [`AnchorStore`] -- named history: resolve, record, list
//! - [`AnchorMapStore`] -- the whole anchor collection as one persistent map
//!   behind a compare-and-set root
//!
//! # Algorithms
//!
//! - [`history`] -- "latest ref at or before t" and the object-store key codec
//! - [`cursor`] -- prefix walker, directory seek, k-way merge, callback adapter
//! - [`pmap`] -- copy-on-write B-tree stored as blobs
//! - [`anchor_map`] -- compare-and-set update loop and the history view over
//!   a map-root store
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once written and never deleted.
//! 2. Every suspending operation takes a [`Context`] and observes it before
//!    I/O, before channel sends and between loop iterations.
//! 3. Drivers classify native failures into [`ErrorKind`]s once.
//! 4. No lock is held across an await, except where a store documents it.

pub mod anchor_map;
pub mod context;
pub mod cursor;
pub mod error;
pub mod history;
pub mod memory;
pub mod pmap;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use context::Context;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use memory::MemStore;
pub use traits::{
    get_anchor, list_anchors, put_anchor, AnchorMapStore, AnchorStore, AnchorStream, BlobStore,
    RefStream,
};

pub use cabs_types::{Anchor, Blob, Ref, Timestamp};
