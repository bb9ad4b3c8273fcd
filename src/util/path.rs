// src/util/path.rs

//! On-disk layout resolution and tenant shard hashing.
//!
//! Keeps path logic in one small, heavily-exercised module: resolve
//! paths, cache the resolutions, and expose explicit invalidation hooks
//! rather than a TTL.

use crate::error::Result;
use crate::util::name::validate_name;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Hidden, per-branch template tenant. Exempt from name validation but
/// hashes to a shard like any other tenant.
pub const EMPTY_TENANT: &str = "__empty__";

/// The tenant every branch always materializes.
pub const MAIN_TENANT: &str = "main";

const MAX_CACHE_SIZE: usize = 10_000;

type ContextKey = (PathBuf, String, String);

fn context_cache() -> &'static Mutex<HashMap<ContextKey, PathBuf>> {
    static CACHE: OnceLock<Mutex<HashMap<ContextKey, PathBuf>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn shard_cache() -> &'static Mutex<HashMap<String, String>> {
    static CACHE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Walk upward from `start` looking for a `.cinchdb` directory.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut current = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    loop {
        if current.join(".cinchdb").exists() {
            return Some(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return None,
        }
    }
}

/// Root directory under which `metadata.db` and per-branch directories live.
pub fn cinchdb_root(project_root: &Path) -> PathBuf {
    project_root.join(".cinchdb")
}

pub fn metadata_db_path(project_root: &Path) -> PathBuf {
    cinchdb_root(project_root).join("metadata.db")
}

/// Root directory for a `<database>-<branch>` context, cached.
pub fn context_root(project_root: &Path, database: &str, branch: &str) -> PathBuf {
    let key: ContextKey = (
        project_root.to_path_buf(),
        database.to_string(),
        branch.to_string(),
    );

    let mut cache = context_cache().lock().unwrap();
    if let Some(path) = cache.get(&key) {
        return path.clone();
    }
    if cache.len() >= MAX_CACHE_SIZE {
        cache.clear();
    }
    let path = cinchdb_root(project_root).join(format!("{database}-{branch}"));
    cache.insert(key, path.clone());
    path
}

/// First two hex characters of `sha256(tenant_name)`, cached.
pub fn calculate_shard(tenant_name: &str) -> String {
    let mut cache = shard_cache().lock().unwrap();
    if let Some(shard) = cache.get(tenant_name) {
        return shard.clone();
    }
    if cache.len() >= MAX_CACHE_SIZE {
        cache.clear();
    }
    let digest = Sha256::digest(tenant_name.as_bytes());
    let shard = format!("{:02x}", digest[0]);
    cache.insert(tenant_name.to_string(), shard.clone());
    shard
}

/// Path to a tenant's SQLite file: `<context_root>/<shard>/<tenant>.db`.
///
/// `database` and `branch` are always validated; `tenant` is validated
/// unless it is the `__empty__` system tenant.
pub fn tenant_db_path(
    project_root: &Path,
    database: &str,
    branch: &str,
    tenant: &str,
) -> Result<PathBuf> {
    validate_name(database, "database")?;
    validate_name(branch, "branch")?;
    if tenant != EMPTY_TENANT {
        validate_name(tenant, "tenant")?;
    }

    let root = context_root(project_root, database, branch);
    let shard = calculate_shard(tenant);
    Ok(root.join(shard).join(format!("{tenant}.db")))
}

/// Like [`tenant_db_path`] but also creates the shard directory.
pub fn ensure_tenant_db_path(
    project_root: &Path,
    database: &str,
    branch: &str,
    tenant: &str,
) -> Result<PathBuf> {
    let path = tenant_db_path(project_root, database, branch, tenant)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(path)
}

pub fn ensure_context_root(project_root: &Path, database: &str, branch: &str) -> Result<PathBuf> {
    let root = context_root(project_root, database, branch);
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

/// Remove cached path resolutions for a database (optionally scoped to one
/// branch) and/or a tenant's shard resolution. Called after deletes so
/// stale entries can't point at removed resources.
pub fn invalidate_cache(database: Option<&str>, branch: Option<&str>, tenant: Option<&str>) {
    if let Some(database) = database {
        let mut cache = context_cache().lock().unwrap();
        cache.retain(|(_, db, br), _| {
            !(db == database && branch.map(|b| b == br).unwrap_or(true))
        });
    }
    if let Some(tenant) = tenant {
        shard_cache().lock().unwrap().remove(tenant);
    }
}

pub fn clear_all_caches() {
    context_cache().lock().unwrap().clear();
    shard_cache().lock().unwrap().clear();
}

#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub path_cache_size: usize,
    pub shard_cache_size: usize,
    pub max_cache_size: usize,
}

pub fn cache_stats() -> CacheStats {
    CacheStats {
        path_cache_size: context_cache().lock().unwrap().len(),
        shard_cache_size: shard_cache().lock().unwrap().len(),
        max_cache_size: MAX_CACHE_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_is_two_hex_chars() {
        let shard = calculate_shard("t1");
        assert_eq!(shard.len(), 2);
        assert!(shard.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shard_matches_known_sha256_prefix() {
        // sha256("main") = c42a... -> first byte 0xc4
        let shard = calculate_shard("main");
        let digest = Sha256::digest(b"main");
        assert_eq!(shard, format!("{:02x}", digest[0]));
    }

    #[test]
    fn empty_tenant_is_exempt_from_validation() {
        let root = std::env::temp_dir();
        let path = tenant_db_path(&root, "mydb", "main", EMPTY_TENANT);
        assert!(path.is_ok());
    }

    #[test]
    fn invalid_tenant_name_is_rejected() {
        let root = std::env::temp_dir();
        let path = tenant_db_path(&root, "mydb", "main", "../evil");
        assert!(path.is_err());
    }

    #[test]
    fn context_root_is_stable_across_calls() {
        let root = std::env::temp_dir();
        let a = context_root(&root, "db1", "main");
        let b = context_root(&root, "db1", "main");
        assert_eq!(a, b);
    }

    #[test]
    fn invalidate_cache_removes_matching_entries() {
        let root = std::env::temp_dir().join("cinchdb_test_invalidate");
        let _ = context_root(&root, "dbx", "main");
        invalidate_cache(Some("dbx"), None, None);
        let stats_before = cache_stats();
        let _ = context_root(&root, "dbx", "main");
        let stats_after = cache_stats();
        assert!(stats_after.path_cache_size >= stats_before.path_cache_size);
    }
}
