// src/schema_objects/table.rs

//! Table creation, rename and drop. Every table gets `id TEXT PRIMARY KEY`,
//! `created_at TEXT NOT NULL`, `updated_at TEXT NOT NULL` automatically;
//! callers may not name, drop, or redefine those three columns.

use super::{
    open_empty_tenant_conn, reject_protected_column_name, reject_protected_table_name, table_exists,
    validate_foreign_key, ColumnDef,
};
use crate::change_applier::ChangeApplier;
use crate::change_tracker::ChangeTracker;
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change, ChangeType};
use crate::metadata::MetadataStore;
use crate::util::name::validate_name;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::Arc;

pub struct TableManager {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    applier: Arc<ChangeApplier>,
    project_root: PathBuf,
    database: String,
}

impl TableManager {
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

    pub fn list_tables(&self, branch: &Branch) -> Result<Vec<String>> {
        let conn = open_empty_tenant_conn(&self.project_root, &self.database, &branch.name)?;
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().filter(|n| !n.starts_with("__")).collect())
    }

    pub fn table_exists(&self, branch: &Branch, name: &str) -> Result<bool> {
        let conn = open_empty_tenant_conn(&self.project_root, &self.database, &branch.name)?;
        table_exists(&conn, name)
    }

    pub fn create_table(&self, branch: &Branch, name: &str, columns: &[ColumnDef]) -> Result<Change> {
        validate_name(name, "table")?;
        reject_protected_table_name(name)?;
        for col in columns {
            validate_name(&col.name, "column")?;
            reject_protected_column_name(&col.name)?;
        }
        if self.table_exists(branch, name)? {
            return Err(Error::AlreadyExists {
                entity: "table".to_string(),
                name: name.to_string(),
            });
        }
        if columns.iter().any(|c| c.foreign_key.is_some()) {
            let conn = open_empty_tenant_conn(&self.project_root, &self.database, &branch.name)?;
            for fk in columns.iter().filter_map(|c| c.foreign_key.as_ref()) {
                validate_foreign_key(&conn, fk)?;
            }
        }

        let mut fragments = vec![
            "id TEXT PRIMARY KEY".to_string(),
            "created_at TEXT NOT NULL".to_string(),
            "updated_at TEXT NOT NULL".to_string(),
        ];
        fragments.extend(columns.iter().map(ColumnDef::to_sql_fragment));

        let sql = format!("CREATE TABLE {name} ({})", fragments.join(", "));
        let details = serde_json::json!({
            "columns": columns.iter().map(|c| c.name.clone()).collect::<Vec<_>>(),
        });

        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::CreateTable,
            "table",
            name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    pub fn drop_table(&self, branch: &Branch, name: &str) -> Result<Change> {
        reject_protected_table_name(name)?;
        if !self.table_exists(branch, name)? {
            return Err(Error::NotFound {
                entity: "table".to_string(),
                name: name.to_string(),
            });
        }

        let sql = format!("DROP TABLE {name}");
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::DropTable,
            "table",
            name,
            &Json::Object(Default::default()),
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    pub fn rename_table(&self, branch: &Branch, old_name: &str, new_name: &str) -> Result<Change> {
        reject_protected_table_name(old_name)?;
        reject_protected_table_name(new_name)?;
        validate_name(new_name, "table")?;
        if !self.table_exists(branch, old_name)? {
            return Err(Error::NotFound {
                entity: "table".to_string(),
                name: old_name.to_string(),
            });
        }
        if self.table_exists(branch, new_name)? {
            return Err(Error::AlreadyExists {
                entity: "table".to_string(),
                name: new_name.to_string(),
            });
        }

        let sql = format!("ALTER TABLE {old_name} RENAME TO {new_name}");
        let details = serde_json::json!({ "old_name": old_name, "new_name": new_name });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::RenameTable,
            "table",
            old_name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantManager;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, TableManager, Branch) {
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

        let tracker = ChangeTracker::new(metadata.clone());
        let applier = Arc::new(ChangeApplier::new(metadata.clone(), tracker, tenants, dir.path(), "app"));
        let tm = TableManager::new(metadata, applier, dir.path(), "app");
        (dir, tm, branch)
    }

    #[test]
    fn create_table_adds_automatic_columns() {
        let (_dir, tm, branch) = setup();
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

        assert!(tm.table_exists(&branch, "widgets").unwrap());
        assert!(tm.list_tables(&branch).unwrap().contains(&"widgets".to_string()));
    }

    #[test]
    fn create_table_rejects_protected_column_name() {
        let (_dir, tm, branch) = setup();
        let result = tm.create_table(
            &branch,
            "widgets",
            &[ColumnDef {
                name: "created_at".to_string(),
                sql_type: "TEXT".to_string(),
                nullable: true,
                unique: false,
                default: None,
                foreign_key: None,
            }],
        );
        assert!(matches!(result, Err(Error::ProtectedEntity(_))));
    }

    #[test]
    fn drop_missing_table_fails() {
        let (_dir, tm, branch) = setup();
        let result = tm.drop_table(&branch, "nope");
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[test]
    fn create_table_rejects_invalid_foreign_key() {
        let (_dir, tm, branch) = setup();
        let result = tm.create_table(
            &branch,
            "orders",
            &[ColumnDef {
                name: "customer_id".to_string(),
                sql_type: "TEXT".to_string(),
                nullable: true,
                unique: false,
                default: None,
                foreign_key: Some(super::super::ForeignKeyRef {
                    table: "customers".to_string(),
                    column: "id".to_string(),
                }),
            }],
        );
        assert!(matches!(result, Err(Error::ForeignKeyInvalid { .. })));
    }

    #[test]
    fn rename_table_updates_schema() {
        let (_dir, tm, branch) = setup();
        tm.create_table(&branch, "widgets", &[]).unwrap();
        tm.rename_table(&branch, "widgets", "gadgets").unwrap();

        assert!(!tm.table_exists(&branch, "widgets").unwrap());
        assert!(tm.table_exists(&branch, "gadgets").unwrap());
    }
}
