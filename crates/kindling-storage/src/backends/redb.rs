//! Redb storage backend implementation.
//!
//! Provides persistent, namespaced JSON storage using the redb embedded
//! database. All namespaces share one table; keys are `namespace \0 key`.

use kindling_core::host::StorageBackend;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

// Single table for all namespaces, value = JSON bytes
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("extension_kv");

const SEPARATOR: char = '\0';

/// Configuration for RedbBackend.
#[derive(Debug, Clone)]
pub struct RedbBackendConfig {
    /// Path to the database file.
    pub path: PathBuf,

    /// Create parent directories if they don't exist.
    pub create_dirs: bool,
}

impl RedbBackendConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_dirs: true,
        }
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }
}

/// Create a namespaced key for the shared table.
fn make_key(namespace: &str, key: &str) -> String {
    let mut result = String::with_capacity(namespace.len() + key.len() + 1);
    result.push_str(namespace);
    result.push(SEPARATOR);
    result.push_str(key);
    result
}

/// Reject a namespace or key that would corrupt the composite key.
fn check_part(part: &'static str, value: &str) -> Result<()> {
    if value.contains(SEPARATOR) {
        return Err(Error::NulByte {
            part,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Key range `[start, end)` covering one namespace.
fn namespace_range(namespace: &str) -> (String, String) {
    let start = format!("{}{}", namespace, SEPARATOR);
    let end = format!("{}{}", namespace, '\u{1}');
    (start, end)
}

/// redb-based persistent storage backend.
pub struct RedbBackend {
    db: Database,
    /// `None` for in-memory databases
    path: Option<PathBuf>,
}

impl RedbBackend {
    /// Create a new RedbBackend with the given configuration.
    pub fn new(config: RedbBackendConfig) -> Result<Self> {
        let path_ref = config.path.as_path();
        if config.create_dirs {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|source| Error::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
            }
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };

        let backend = Self {
            db,
            path: Some(config.path.clone()),
        };
        backend.ensure_tables()?;
        tracing::debug!(path = %path_ref.display(), "Opened redb storage");
        Ok(backend)
    }

    /// Open or create a redb backend at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(RedbBackendConfig::new(path.as_ref()))
    }

    /// Non-persistent database, for tests and ephemeral hosts.
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let backend = Self { db, path: None };
        backend.ensure_tables()?;
        Ok(backend)
    }

    /// Get the storage path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn ensure_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn read(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        match table.get(make_key(namespace, key).as_str())? {
            Some(data) => serde_json::from_slice(data.value())
                .map(Some)
                .map_err(|source| Error::Corrupt {
                    namespace: namespace.to_string(),
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub fn write(&self, namespace: &str, key: &str, value: &Value) -> Result<()> {
        check_part("namespace", namespace)?;
        check_part("key", key)?;
        let bytes = serde_json::to_vec(value).map_err(|source| Error::Encode {
            namespace: namespace.to_string(),
            key: key.to_string(),
            source,
        })?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            table.insert(make_key(namespace, key).as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(KV_TABLE)?;
            let removed = table.remove(make_key(namespace, key).as_str())?.is_some();
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Keys of one namespace, sorted.
    pub fn list_keys(&self, namespace: &str) -> Result<Vec<String>> {
        let (start, end) = namespace_range(namespace);
        let prefix_len = start.len();

        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let mut keys = Vec::new();
        for result in table.range(&*start..&*end)? {
            let (key, _) = result?;
            keys.push(key.value()[prefix_len..].to_string());
        }
        Ok(keys)
    }

    /// Delete every key of a namespace. Returns how many were removed.
    pub fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let keys = self.list_keys(namespace)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV_TABLE)?;
            for key in &keys {
                table.remove(make_key(namespace, key).as_str())?;
            }
        }
        txn.commit()?;
        Ok(keys.len())
    }

    /// Distinct namespaces holding at least one key.
    pub fn namespaces(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV_TABLE)?;
        let mut namespaces: Vec<String> = Vec::new();
        for result in table.iter()? {
            let (key, _) = result?;
            let Some((namespace, _)) = key.value().split_once(SEPARATOR) else {
                continue;
            };
            if namespaces.last().map(String::as_str) != Some(namespace) {
                namespaces.push(namespace.to_string());
            }
        }
        Ok(namespaces)
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, namespace: &str, key: &str) -> kindling_core::Result<Option<Value>> {
        Ok(self.read(namespace, key)?)
    }

    fn set(&self, namespace: &str, key: &str, value: &Value) -> kindling_core::Result<()> {
        Ok(self.write(namespace, key, value)?)
    }

    fn delete(&self, namespace: &str, key: &str) -> kindling_core::Result<bool> {
        Ok(self.remove(namespace, key)?)
    }

    fn keys(&self, namespace: &str) -> kindling_core::Result<Vec<String>> {
        Ok(self.list_keys(namespace)?)
    }
}
