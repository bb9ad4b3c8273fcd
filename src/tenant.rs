// src/tenant.rs

//! Tenant lifecycle: catalog rows plus the lazy/copy-on-write storage
//! scheme. A tenant is "lazy" until its SQLite file is actually
//! materialized on disk; until then, reads are served by copying the
//! branch's `__empty__` template file in on first write.

use crate::connection::{self, EncryptionConfig};
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Tenant};
use crate::metadata::MetadataStore;
use crate::util::name::validate_name;
use crate::util::path::{self, EMPTY_TENANT, MAIN_TENANT};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub struct TenantManager {
    metadata: Arc<MetadataStore>,
    project_root: PathBuf,
    database: String,
}

impl TenantManager {
    pub fn new(metadata: Arc<MetadataStore>, project_root: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            metadata,
            project_root: project_root.into(),
            database: database.into(),
        }
    }

    /// Ensure `branch`'s hidden `__empty__` template tenant exists both as a
    /// catalog row and as a materialized, schema-only SQLite file. Called
    /// once when a branch is created.
    pub fn ensure_empty_tenant(&self, branch: &Branch) -> Result<()> {
        if self.metadata.get_tenant(&branch.id, EMPTY_TENANT)?.is_none() {
            let shard = path::calculate_shard(EMPTY_TENANT);
            self.metadata.create_tenant(&branch.id, EMPTY_TENANT, &shard)?;
        }
        let db_path = path::ensure_tenant_db_path(&self.project_root, &self.database, &branch.name, EMPTY_TENANT)?;
        if !db_path.exists() {
            connection::open(&db_path, &EncryptionConfig::disabled())?;
        }
        self.metadata
            .mark_tenant_materialized(&self.metadata.get_tenant(&branch.id, EMPTY_TENANT)?.unwrap().id)?;
        Ok(())
    }

    pub fn list_tenants(&self, branch_id: &str) -> Result<Vec<Tenant>> {
        Ok(self
            .metadata
            .list_tenants(branch_id, false)?
            .into_iter()
            .filter(|t| t.name != EMPTY_TENANT)
            .collect())
    }

    /// Register a new tenant row. When `lazy` is true (the default a caller
    /// should reach for) the tenant has no on-disk file until the first
    /// write materializes it from `__empty__`; when `lazy` is false it is
    /// materialized immediately, before returning.
    pub fn create_tenant(&self, branch: &Branch, name: &str, lazy: bool) -> Result<Tenant> {
        validate_name(name, "tenant")?;
        if name == EMPTY_TENANT {
            return Err(Error::ProtectedEntity(format!("tenant name '{EMPTY_TENANT}' is reserved")));
        }
        if self.metadata.get_tenant(&branch.id, name)?.is_some() {
            return Err(Error::AlreadyExists {
                entity: "tenant".to_string(),
                name: name.to_string(),
            });
        }
        let shard = path::calculate_shard(name);
        let mut tenant = self.metadata.create_tenant(&branch.id, name, &shard)?;
        if lazy {
            info!(tenant = name, branch = branch.name, "registered lazy tenant");
        } else {
            self.materialize_tenant(branch, &tenant)?;
            tenant.materialized = true;
            info!(tenant = name, branch = branch.name, "registered and materialized tenant");
        }
        Ok(tenant)
    }

    pub fn is_tenant_lazy(&self, branch: &Branch, tenant_name: &str) -> Result<bool> {
        let path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, tenant_name)?;
        Ok(!path.exists())
    }

    /// Copy the branch's `__empty__` template onto the tenant's path if it
    /// is not already materialized. Idempotent: a materialized tenant is
    /// left untouched.
    pub fn materialize_tenant(&self, branch: &Branch, tenant: &Tenant) -> Result<PathBuf> {
        let target = path::ensure_tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
        if target.exists() {
            return Ok(target);
        }
        let template = path::tenant_db_path(&self.project_root, &self.database, &branch.name, EMPTY_TENANT)?;
        std::fs::copy(&template, &target)?;
        self.metadata.mark_tenant_materialized(&tenant.id)?;
        debug!(tenant = tenant.name, branch = branch.name, "materialized tenant from template");
        Ok(target)
    }

    pub fn delete_tenant(&self, branch: &Branch, tenant: &Tenant) -> Result<()> {
        if tenant.is_main() || tenant.is_empty_template() {
            return Err(Error::ProtectedEntity(format!("tenant '{}' cannot be deleted", tenant.name)));
        }
        let db_path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
        if db_path.exists() {
            let _ = std::fs::remove_file(&db_path);
            let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
            let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
        }
        self.metadata.delete_tenant(&tenant.id)?;
        path::invalidate_cache(None, None, Some(&tenant.name));
        Ok(())
    }

    pub fn rename_tenant(&self, branch: &Branch, tenant: &Tenant, new_name: &str) -> Result<Tenant> {
        if tenant.is_main() || tenant.is_empty_template() {
            return Err(Error::ProtectedEntity(format!("tenant '{}' cannot be renamed", tenant.name)));
        }
        validate_name(new_name, "tenant")?;
        if self.metadata.get_tenant(&branch.id, new_name)?.is_some() {
            return Err(Error::AlreadyExists {
                entity: "tenant".to_string(),
                name: new_name.to_string(),
            });
        }

        let old_path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
        let new_shard = path::calculate_shard(new_name);
        if old_path.exists() {
            let new_path = path::ensure_tenant_db_path(&self.project_root, &self.database, &branch.name, new_name)?;
            std::fs::rename(&old_path, &new_path)?;
        }
        self.metadata.rename_tenant(&tenant.id, new_name, &new_shard)?;
        path::invalidate_cache(None, None, Some(&tenant.name));
        self.metadata
            .get_tenant(&branch.id, new_name)?
            .ok_or_else(|| Error::CatalogError("tenant vanished after rename".into()))
    }

    /// Copy one tenant's materialized (or template) file to a brand-new
    /// catalog row and file. Used by branch creation to seed a new branch's
    /// tenants from its parent.
    pub fn copy_tenant(
        &self,
        source_branch: &Branch,
        source_tenant: &Tenant,
        target_branch: &Branch,
    ) -> Result<Tenant> {
        let shard = path::calculate_shard(&source_tenant.name);
        let target_tenant = self.metadata.create_tenant(&target_branch.id, &source_tenant.name, &shard)?;

        let source_name = if source_tenant.is_empty_template() || !source_tenant.materialized {
            EMPTY_TENANT
        } else {
            source_tenant.name.as_str()
        };
        let source_path = path::tenant_db_path(&self.project_root, &self.database, &source_branch.name, source_name)?;
        let target_path = path::ensure_tenant_db_path(&self.project_root, &self.database, &target_branch.name, &source_tenant.name)?;

        if source_path.exists() {
            std::fs::copy(&source_path, &target_path)?;
            self.metadata.mark_tenant_materialized(&target_tenant.id)?;
        }
        Ok(target_tenant)
    }

    /// Resolved on-disk path a manager should open for `(branch, tenant)`.
    /// A write materializes a lazy tenant first; a read of a still-lazy
    /// tenant is served from the branch's `__empty__` template instead, so
    /// reading never has the side effect of creating a file.
    pub fn get_tenant_db_path_for_operation(&self, branch: &Branch, tenant: &Tenant, is_write: bool) -> Result<PathBuf> {
        if is_write {
            return self.materialize_tenant(branch, tenant);
        }
        if self.is_tenant_lazy(branch, &tenant.name)? {
            return path::tenant_db_path(&self.project_root, &self.database, &branch.name, EMPTY_TENANT);
        }
        path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)
    }

    pub fn get_tenant_size(&self, branch: &Branch, tenant: &Tenant) -> Result<u64> {
        let path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_all_tenant_sizes(&self, branch: &Branch) -> Result<Vec<(String, u64)>> {
        self.list_tenants(&branch.id)?
            .into_iter()
            .map(|t| {
                let size = self.get_tenant_size(branch, &t)?;
                Ok((t.name, size))
            })
            .collect()
    }

    pub fn vacuum_tenant(&self, branch: &Branch, tenant: &Tenant) -> Result<VacuumOutcome> {
        let path = self.get_tenant_db_path_for_operation(branch, tenant, true)?;
        let size_before = std::fs::metadata(&path)?.len();

        let started = std::time::Instant::now();
        let conn = connection::open_existing(&path, &EncryptionConfig::disabled())?;
        conn.execute_batch("VACUUM;")?;
        let duration = started.elapsed();

        let size_after = std::fs::metadata(&path)?.len();
        Ok(VacuumOutcome {
            size_before,
            size_after,
            duration,
        })
    }
}

/// Size-before/after and wall-clock duration of a `VACUUM` run.
#[derive(Debug, Clone, Copy)]
pub struct VacuumOutcome {
    pub size_before: u64,
    pub size_after: u64,
    pub duration: std::time::Duration,
}

/// True for the two system tenant names that user-facing operations must
/// never target directly.
pub fn is_system_tenant(name: &str) -> bool {
    name == EMPTY_TENANT || name == MAIN_TENANT
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, TenantManager, Branch) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let branch = metadata.create_branch(&db.id, "main", None).unwrap();
        let tm = TenantManager::new(metadata, dir.path(), "app");
        tm.ensure_empty_tenant(&branch).unwrap();
        (dir, tm, branch)
    }

    #[test]
    fn new_tenant_is_lazy_until_materialized() {
        let (_dir, tm, branch) = manager();
        let tenant = tm.create_tenant(&branch, "acme", true).unwrap();
        assert!(tm.is_tenant_lazy(&branch, "acme").unwrap());

        tm.materialize_tenant(&branch, &tenant).unwrap();
        assert!(!tm.is_tenant_lazy(&branch, "acme").unwrap());
    }

    #[test]
    fn create_tenant_with_lazy_false_materializes_immediately() {
        let (_dir, tm, branch) = manager();
        let tenant = tm.create_tenant(&branch, "acme", false).unwrap();
        assert!(tenant.materialized);
        assert!(!tm.is_tenant_lazy(&branch, "acme").unwrap());
    }

    #[test]
    fn creating_reserved_tenant_name_fails() {
        let (_dir, tm, branch) = manager();
        let result = tm.create_tenant(&branch, EMPTY_TENANT, true);
        assert!(matches!(result, Err(Error::ProtectedEntity(_))));
    }

    #[test]
    fn duplicate_tenant_name_fails() {
        let (_dir, tm, branch) = manager();
        tm.create_tenant(&branch, "acme", true).unwrap();
        let result = tm.create_tenant(&branch, "acme", true);
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn delete_tenant_removes_file_and_row() {
        let (_dir, tm, branch) = manager();
        let tenant = tm.create_tenant(&branch, "acme", true).unwrap();
        tm.materialize_tenant(&branch, &tenant).unwrap();

        tm.delete_tenant(&branch, &tenant).unwrap();
        let path = path::tenant_db_path(&tm.project_root, &tm.database, &branch.name, "acme").unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn rename_tenant_moves_materialized_file() {
        let (_dir, tm, branch) = manager();
        let tenant = tm.create_tenant(&branch, "acme", true).unwrap();
        tm.materialize_tenant(&branch, &tenant).unwrap();

        let renamed = tm.rename_tenant(&branch, &tenant, "acme2").unwrap();
        assert_eq!(renamed.name, "acme2");
        assert!(!tm.is_tenant_lazy(&branch, "acme2").unwrap());
    }
}
