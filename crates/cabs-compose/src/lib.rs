//! Composite CABS stores.
//!
//! Each composite implements the same contracts as the stores it wraps, so
//! they stack freely: a logging store over an LRU cache over a replica of a
//! file tree and an SQLite database is just another [`BlobStore`].
//!
//! # Composites
//!
//! - [`ReplicaStore`] -- synchronous members written on every put,
//!   asynchronous members fed through bounded queues, sticky failure
//! - [`LruStore`] -- bounded least-recently-used blob cache
//! - [`TransformStore`] -- encoded (zstd) bodies behind an original-to-storage
//!   ref map kept under an anchor
//! - [`LoggingStore`] -- one trace event per operation
//!
//! [`BlobStore`]: cabs_store::BlobStore

pub mod logging;
pub mod lru;
pub mod replica;
pub mod transform;

// Re-export primary types at crate root for ergonomic imports.
pub use logging::LoggingStore;
pub use lru::{CacheStats, LruStore};
pub use replica::{ReplicaConfig, ReplicaStore, DEFAULT_MAX_QUEUE};
pub use transform::{Codec, TransformStore, ZstdCodec, DEFAULT_ANCHOR, DEFAULT_LEVEL};
