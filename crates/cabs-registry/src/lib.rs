//! Configuration-driven store construction for CABS.
//!
//! A store is described by a JSON document whose `type` field names a
//! registered [`StoreFactory`]. Composite types carry their members as
//! nested documents, so an entire stack opens from one document:
//!
//! ```json
//! {"type": "lru", "size": 1024,
//!  "nested": {"type": "replica",
//!             "sync": [{"type": "file", "root": "/var/cabs"}],
//!             "async": [{"type": "sqlite", "path": "/var/cabs.db"}]}}
//! ```
//!
//! # Design Rules
//!
//! 1. The process-wide registry is fixed before first use and read-only
//!    afterwards.
//! 2. Configuration mistakes surface as [`RegistryError`]s for which
//!    [`RegistryError::is_config`] holds; failures of the stores being
//!    opened do not.

pub mod error;
pub mod factories;
pub mod registry;

// Re-export primary types at crate root for ergonomic imports.
pub use error::{RegistryError, RegistryResult};
pub use registry::{default_registry, install_default, Registry, StoreFactory};
