//! Persistent storage for the Kindling extension runtime.
//!
//! Provides a redb-backed [`RedbBackend`] for the host's storage capability.
//!
//! ```rust,ignore
//! let backend = Arc::new(RedbBackend::open("data/extensions.redb")?);
//! let host = HostEnvironment::builder()
//!     .with_storage(ScopedStorage::new(backend.clone(), "tasks"))
//!     .build();
//! ```

pub mod backends;
pub mod error;

pub use backends::{RedbBackend, RedbBackendConfig};
pub use error::{Error, Result};

/// Default database file name inside a data directory.
pub const DEFAULT_DB_FILE: &str = "extensions.redb";
