// src/schema_objects/view.rs

//! View creation, update and drop. A view has no automatic columns and
//! carries no data of its own; `UPDATE_VIEW` is modelled as `DROP VIEW IF
//! EXISTS` followed by `CREATE VIEW`, packaged as a two-step change so
//! replaying it on any tenant is idempotent.

use super::reject_protected_table_name;
use crate::change_applier::ChangeApplier;
use crate::change_tracker::ChangeTracker;
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change, ChangeType};
use crate::metadata::MetadataStore;
use crate::util::name::validate_name;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ViewManager {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    applier: Arc<ChangeApplier>,
    project_root: PathBuf,
    database: String,
}

impl ViewManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        applier: Arc<ChangeApplier>,
        project_root: impl Into<PathBuf>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            tracker: ChangeTracker::new(metadata.clone()),
            metadata,
            applier,
            project_root: project_root.into(),
            database: database.into(),
        }
    }

    fn conn(&self, branch: &Branch) -> Result<rusqlite::Connection> {
        super::open_empty_tenant_conn(&self.project_root, &self.database, &branch.name)
    }

    fn view_exists(&self, branch: &Branch, name: &str) -> Result<bool> {
        let conn = self.conn(branch)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'view' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn list_views(&self, branch: &Branch) -> Result<Vec<String>> {
        let conn = self.conn(branch)?;
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'view' ORDER BY name")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_view(&self, branch: &Branch, name: &str, select_sql: &str) -> Result<Change> {
        validate_name(name, "table")?;
        reject_protected_table_name(name)?;
        if self.view_exists(branch, name)? {
            return Err(Error::AlreadyExists {
                entity: "view".to_string(),
                name: name.to_string(),
            });
        }

        let sql = format!("CREATE VIEW {name} AS {select_sql}");
        let details = serde_json::json!({ "select_sql": select_sql });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::CreateView,
            "view",
            name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    pub fn drop_view(&self, branch: &Branch, name: &str) -> Result<Change> {
        if !self.view_exists(branch, name)? {
            return Err(Error::NotFound {
                entity: "view".to_string(),
                name: name.to_string(),
            });
        }

        let sql = format!("DROP VIEW {name}");
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::DropView,
            "view",
            name,
            &Json::Object(Default::default()),
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    /// Redefine an existing view's query. Packaged as a `DROP IF EXISTS` +
    /// `CREATE` pair so the replay is safe even against a tenant that never
    /// saw the original `CREATE_VIEW`.
    pub fn update_view(&self, branch: &Branch, name: &str, select_sql: &str) -> Result<Change> {
        if !self.view_exists(branch, name)? {
            return Err(Error::NotFound {
                entity: "view".to_string(),
                name: name.to_string(),
            });
        }

        let statements = serde_json::json!([
            { "step": "DROP", "sql": format!("DROP VIEW IF EXISTS {name}") },
            { "step": "CREATE", "sql": format!("CREATE VIEW {name} AS {select_sql}") },
        ]);
        let details = serde_json::json!({ "select_sql": select_sql, "statements": statements });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::UpdateView,
            "view",
            name,
            &details,
            None,
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_objects::table::TableManager;
    use crate::schema_objects::ColumnDef;
    use crate::tenant::TenantManager;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, TableManager, ViewManager, Branch) {
        std::env::set_var("CINCHDB_SKIP_MAINTENANCE_DELAY", "1");
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let branch = metadata.create_branch(&db.id, "main", None).unwrap();

        let tenants = TenantManager::new(metadata.clone(), dir.path(), "app");
        tenants.ensure_empty_tenant(&branch).unwrap();
        let main_tenant = tenants.create_tenant(&branch, "main", true).unwrap();
        tenants.materialize_tenant(&branch, &main_tenant).unwrap();

        let applier = Arc::new(ChangeApplier::new(
            metadata.clone(),
            ChangeTracker::new(metadata.clone()),
            tenants,
            dir.path(),
            "app",
        ));
        let table_manager = TableManager::new(metadata.clone(), applier.clone(), dir.path(), "app");
        let view_manager = ViewManager::new(metadata, applier, dir.path(), "app");
        (dir, table_manager, view_manager, branch)
    }

    #[test]
    fn create_view_is_queryable() {
        let (_dir, tm, vm, branch) = setup();
        tm.create_table(
            &branch,
            "widgets",
            &[ColumnDef {
                name: "label".to_string(),
                sql_type: "TEXT".to_string(),
                nullable: true,
                unique: false,
                default: None,
                foreign_key: None,
            }],
        )
        .unwrap();

        vm.create_view(&branch, "widget_labels", "SELECT id, label FROM widgets").unwrap();
        assert!(vm.list_views(&branch).unwrap().contains(&"widget_labels".to_string()));
    }

    #[test]
    fn update_view_redefines_query() {
        let (_dir, tm, vm, branch) = setup();
        tm.create_table(&branch, "widgets", &[]).unwrap();
        vm.create_view(&branch, "all_widgets", "SELECT id FROM widgets").unwrap();

        vm.update_view(&branch, "all_widgets", "SELECT id, created_at FROM widgets").unwrap();
        assert!(vm.list_views(&branch).unwrap().contains(&"all_widgets".to_string()));
    }

    #[test]
    fn drop_missing_view_fails() {
        let (_dir, _tm, vm, branch) = setup();
        let result = vm.drop_view(&branch, "nope");
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }
}
