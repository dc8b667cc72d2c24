//! Storage backend implementations.
//!
//! Backends implement [`kindling_core::host::StorageBackend`] and are shared by
//! every extension of a host; each extension sees its own namespace through
//! [`kindling_core::host::ScopedStorage`].

pub mod redb;

pub use self::redb::{RedbBackend, RedbBackendConfig};
