// src/connection.rs

//! SQLite connection management for CinchDB.
//!
//! Opens a tenant or metadata file with WAL mode and the pragmas every
//! CinchDB connection needs, and provides a small thread-safe pool keyed
//! by resolved path so managers can reuse one writer per process.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Pluggable encryption configuration.
///
/// Kept as a thin interface (rather than baking a specific cipher in) so a
/// build without an encryption provider still compiles. When `enabled` is
/// true, `key` must be set or [`open`] fails with
/// [`Error::EncryptionKeyMissing`].
#[derive(Debug, Clone, Default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key: Option<String>,
}

impl EncryptionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            key: None,
        }
    }

    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            enabled: true,
            key: Some(key.into()),
        }
    }

    fn apply(&self, conn: &Connection) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let key = self.key.as_deref().ok_or(Error::EncryptionKeyMissing)?;
        // PRAGMA key is a no-op on a plain SQLite build and takes effect
        // only against a cipher-capable provider; kept as the seam a
        // SQLCipher-backed build would hook into.
        conn.pragma_update(None, "key", key)?;
        Ok(())
    }
}

/// Open a SQLite file with WAL mode, tuned pragmas, and optional encryption.
///
/// Creates parent directories as needed. Row access is by column name via
/// `rusqlite`'s default `Row::get` by index or name.
pub fn open(path: &Path, encryption: &EncryptionConfig) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    encryption.apply(&conn)?;

    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 0;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 30000;
        ",
    )?;

    debug!(path = %path.display(), "opened sqlite connection");
    Ok(conn)
}

/// Open a SQLite file without creating it if it doesn't already exist.
pub fn open_existing(path: &Path, encryption: &EncryptionConfig) -> Result<Connection> {
    if !path.exists() {
        return Err(Error::CatalogError(format!(
            "database file not found at {}",
            path.display()
        )));
    }
    open(path, encryption)
}

/// A thread-safe pool of connections keyed by resolved path.
///
/// Concurrency within the pool is delegated to SQLite's own locking: a
/// pooled connection is handed out behind a single `Mutex`, so only one
/// operation touches a given file at a time from this process.
pub struct ConnectionPool {
    encryption: EncryptionConfig,
    connections: Mutex<HashMap<PathBuf, Mutex<Connection>>>,
}

impl ConnectionPool {
    pub fn new(encryption: EncryptionConfig) -> Self {
        Self {
            encryption,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` with the pooled connection for `path`, opening one if needed.
    pub fn with_connection<T>(&self, path: &Path, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let key = path.to_path_buf();
        {
            let mut conns = self.connections.lock().unwrap();
            if !conns.contains_key(&key) {
                let conn = open(path, &self.encryption)?;
                conns.insert(key.clone(), Mutex::new(conn));
            }
        }
        let conns = self.connections.lock().unwrap();
        let conn_lock = conns.get(&key).expect("just inserted");
        let conn = conn_lock.lock().unwrap();
        f(&conn)
    }

    /// Close and evict the connection for `path`, if pooled.
    pub fn close(&self, path: &Path) {
        let key = path.to_path_buf();
        self.connections.lock().unwrap().remove(&key);
    }

    /// Close every pooled connection.
    pub fn close_all(&self) {
        self.connections.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_parent_directories_and_sets_pragmas() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/db.sqlite");
        let conn = open(&path, &EncryptionConfig::disabled()).unwrap();

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal_mode.to_lowercase(), "wal");

        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn open_existing_fails_when_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let result = open_existing(&path, &EncryptionConfig::disabled());
        assert!(result.is_err());
    }

    #[test]
    fn encryption_enabled_without_key_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("enc.db");
        let result = open(&path, &EncryptionConfig { enabled: true, key: None });
        assert!(matches!(result, Err(Error::EncryptionKeyMissing)));
    }

    #[test]
    fn pool_reuses_connection_for_same_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pooled.db");
        let pool = ConnectionPool::new(EncryptionConfig::disabled());

        pool.with_connection(&path, |conn| {
            conn.execute("CREATE TABLE t (id INTEGER)", [])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(pool.len(), 1);

        pool.with_connection(&path, |conn| {
            conn.execute("INSERT INTO t (id) VALUES (1)", [])?;
            Ok(())
        })
        .unwrap();

        assert_eq!(pool.len(), 1);
    }
}
