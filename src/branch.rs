// src/branch.rs

//! Branch lifecycle: create, list, delete. Creating a branch seeds its
//! `__empty__` template and copies the parent's tenant set and full change
//! history so the new branch starts schema-identical to its parent.

use crate::change_tracker::ChangeTracker;
use crate::error::{Error, Result};
use crate::metadata::models::Branch;
use crate::metadata::MetadataStore;
use crate::tenant::TenantManager;
use crate::util::name::validate_name;
use crate::util::path;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct BranchManager {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    tenants: TenantManager,
    project_root: PathBuf,
    database: String,
}

impl BranchManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        tracker: ChangeTracker,
        tenants: TenantManager,
        project_root: impl Into<PathBuf>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            tracker,
            tenants,
            project_root: project_root.into(),
            database: database.into(),
        }
    }

    pub fn list_branches(&self, database_id: &str) -> Result<Vec<Branch>> {
        self.metadata.list_branches(database_id, false)
    }

    pub fn branch_exists(&self, database_id: &str, name: &str) -> Result<bool> {
        Ok(self.metadata.get_branch(database_id, name)?.is_some())
    }

    /// Create `name` off of `parent_name` (default `"main"` if `None`),
    /// inheriting the parent's tenants and change history.
    pub fn create_branch(&self, database_id: &str, name: &str, parent_name: Option<&str>) -> Result<Branch> {
        validate_name(name, "branch")?;
        if self.branch_exists(database_id, name)? {
            return Err(Error::AlreadyExists {
                entity: "branch".to_string(),
                name: name.to_string(),
            });
        }

        let parent_name = parent_name.unwrap_or(crate::util::path::MAIN_TENANT);
        let parent = self
            .metadata
            .get_branch(database_id, parent_name)?
            .ok_or_else(|| Error::NotFound {
                entity: "branch".to_string(),
                name: parent_name.to_string(),
            })?;

        let branch = self.metadata.create_branch(database_id, name, Some(parent_name))?;
        self.tenants.ensure_empty_tenant(&branch)?;

        for tenant in self.metadata.list_tenants(&parent.id, false)? {
            if tenant.name == crate::util::path::EMPTY_TENANT {
                continue;
            }
            self.tenants.copy_tenant(&parent, &tenant, &branch)?;
        }

        let copied = self
            .tracker
            .copy_branch_changes(&parent.id, &parent.name, &branch.id, &branch.name)?;

        self.metadata.mark_branch_materialized(&branch.id)?;
        info!(branch = name, parent = parent_name, copied_changes = copied, "created branch");

        self.metadata
            .get_branch(database_id, name)?
            .ok_or_else(|| Error::CatalogError("branch vanished after creation".to_string()))
    }

    /// Archive a branch and hard-delete its tenant catalog rows, then
    /// purge its on-disk tenant files and branch directory. `main` can
    /// never be deleted.
    pub fn delete_branch(&self, branch: &Branch) -> Result<()> {
        if branch.is_main() {
            return Err(Error::ProtectedEntity("the 'main' branch cannot be deleted".to_string()));
        }
        self.metadata.delete_branch(&branch.id)?;

        let root = path::context_root(&self.project_root, &self.database, &branch.name);
        if root.exists() {
            if let Err(err) = std::fs::remove_dir_all(&root) {
                warn!(branch = branch.name.as_str(), error = %err, "failed to remove branch directory");
            }
        }
        path::invalidate_cache(Some(&self.database), Some(&branch.name), None);
        info!(branch = branch.name.as_str(), "deleted branch");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, BranchManager, String) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let main = metadata.create_branch(&db.id, "main", None).unwrap();

        let tenants = TenantManager::new(metadata.clone(), dir.path(), "app");
        tenants.ensure_empty_tenant(&main).unwrap();
        let main_tenant = tenants.create_tenant(&main, "main", true).unwrap();
        tenants.materialize_tenant(&main, &main_tenant).unwrap();

        let tracker = ChangeTracker::new(metadata.clone());
        let bm = BranchManager::new(metadata.clone(), tracker, tenants, dir.path(), "app");
        (dir, bm, db.id)
    }

    #[test]
    fn create_branch_inherits_tenants() {
        let (_dir, bm, db_id) = manager();
        let feature = bm.create_branch(&db_id, "feature", None).unwrap();

        let tenants = bm.metadata.list_tenants(&feature.id, false).unwrap();
        let names: Vec<_> = tenants.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"main"));
        assert!(names.contains(&crate::util::path::EMPTY_TENANT));
    }

    #[test]
    fn cannot_delete_main() {
        let (_dir, bm, db_id) = manager();
        let main = bm.metadata.get_branch(&db_id, "main").unwrap().unwrap();
        let result = bm.delete_branch(&main);
        assert!(matches!(result, Err(Error::ProtectedEntity(_))));
    }

    #[test]
    fn duplicate_branch_name_fails() {
        let (_dir, bm, db_id) = manager();
        bm.create_branch(&db_id, "feature", None).unwrap();
        let result = bm.create_branch(&db_id, "feature", None);
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }
}
