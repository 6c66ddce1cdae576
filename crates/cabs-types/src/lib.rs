//! Foundation types for CABS, the content-addressable blob store.
//!
//! Every other CABS crate depends on `cabs-types`.
//!
//! # Key Types
//!
//! - [`Ref`] — 32-byte SHA-256 content identifier, ordered bytewise
//! - [`Blob`] — an immutable byte sequence
//! - [`Anchor`] — a `(name, at, ref)` entry in a named, timestamped history
//! - [`Timestamp`] — an absolute instant with nanosecond resolution

pub mod anchor;
pub mod error;
pub mod refs;
pub mod time;

pub use anchor::Anchor;
pub use error::TypeError;
pub use refs::{hash, Ref, REF_HEX_LEN, REF_LEN};
pub use time::{max_time, parse_timestamp, Timestamp, MAX_NANOS};

/// An arbitrary, immutable byte sequence.
pub type Blob = bytes::Bytes;
