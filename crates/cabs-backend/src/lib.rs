//! Storage drivers for CABS.
//!
//! Each driver implements [`BlobStore`](cabs_store::BlobStore) plus one
//! anchor shape, and represents one enumeration class:
//!
//! - [`FileStore`] -- hierarchical file tree, directory-level binary search,
//!   map-root anchors behind a 32-byte register file
//! - [`SqliteStore`] -- range-capable SQL tables, history-per-name anchors
//! - [`BucketStore`] -- any [`ObjectBucket`], prefix listings only,
//!   key-encoded anchor history ([`MemBucket`] is the in-memory bucket)

pub mod bucket;
pub mod file;
pub mod sqlite;

pub use bucket::{BucketStore, KeyStream, MemBucket, ObjectBucket};
pub use file::FileStore;
pub use sqlite::SqliteStore;
