// src/schema_objects/index.rs

//! Index creation, listing, info and drop. Indexes carry no data of their
//! own; like tables and views they replicate across tenants purely by
//! going through the change-tracked pipeline.

use super::table_exists;
use crate::change_applier::ChangeApplier;
use crate::change_tracker::ChangeTracker;
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change, ChangeType};
use crate::metadata::MetadataStore;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub unique: bool,
    pub columns: Vec<String>,
}

pub struct IndexManager {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    applier: Arc<ChangeApplier>,
    project_root: PathBuf,
    database: String,
}

impl IndexManager {
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

    fn auto_name(table: &str, columns: &[String]) -> String {
        format!("idx_{table}_{}", columns.join("_"))
    }

    pub fn list_indexes(&self, branch: &Branch, table: &str) -> Result<Vec<IndexInfo>> {
        let conn = self.conn(branch)?;
        if !table_exists(&conn, table)? {
            return Err(Error::NotFound {
                entity: "table".to_string(),
                name: table.to_string(),
            });
        }
        let mut stmt = conn.prepare("PRAGMA index_list(?1)")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([table], |row| Ok((row.get::<_, String>("name")?, row.get::<_, i64>("unique")?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut infos = Vec::new();
        for (name, unique) in rows {
            if name.starts_with("sqlite_autoindex_") {
                continue;
            }
            let mut col_stmt = conn.prepare("PRAGMA index_info(?1)")?;
            let columns = col_stmt
                .query_map([&name], |row| row.get::<_, String>("name"))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            infos.push(IndexInfo {
                name,
                table: table.to_string(),
                unique: unique != 0,
                columns,
            });
        }
        Ok(infos)
    }

    pub fn get_index(&self, branch: &Branch, table: &str, index_name: &str) -> Result<IndexInfo> {
        self.list_indexes(branch, table)?
            .into_iter()
            .find(|i| i.name == index_name)
            .ok_or_else(|| Error::NotFound {
                entity: "index".to_string(),
                name: index_name.to_string(),
            })
    }

    /// Create an index, auto-naming it `idx_<table>_<cols>` when `name` is
    /// `None`. Supports `unique` and is always emitted with
    /// `IF NOT EXISTS` so a replay against an already-patched tenant is
    /// harmless.
    pub fn create_index(
        &self,
        branch: &Branch,
        table: &str,
        columns: &[String],
        unique: bool,
        name: Option<&str>,
    ) -> Result<Change> {
        if columns.is_empty() {
            return Err(Error::InvalidName("an index needs at least one column".to_string()));
        }
        let conn = self.conn(branch)?;
        if !table_exists(&conn, table)? {
            return Err(Error::NotFound {
                entity: "table".to_string(),
                name: table.to_string(),
            });
        }

        let index_name = name.map(str::to_string).unwrap_or_else(|| Self::auto_name(table, columns));
        crate::util::name::validate_name(&index_name, "table")?;

        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [&index_name],
            |row| row.get(0),
        )?;
        if exists > 0 {
            return Err(Error::AlreadyExists {
                entity: "index".to_string(),
                name: index_name,
            });
        }

        let unique_kw = if unique { "UNIQUE " } else { "" };
        let sql = format!(
            "CREATE {unique_kw}INDEX IF NOT EXISTS {index_name} ON {table} ({})",
            columns.join(", ")
        );
        let details = serde_json::json!({ "table": table, "columns": columns, "unique": unique });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::CreateIndex,
            "index",
            &index_name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    pub fn drop_index(&self, branch: &Branch, index_name: &str) -> Result<Change> {
        let conn = self.conn(branch)?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [index_name],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(Error::NotFound {
                entity: "index".to_string(),
                name: index_name.to_string(),
            });
        }

        let sql = format!("DROP INDEX {index_name}");
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::DropIndex,
            "index",
            index_name,
            &Json::Object(Default::default()),
            Some(&sql),
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

    fn setup() -> (tempfile::TempDir, TableManager, IndexManager, Branch) {
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
        let index_manager = IndexManager::new(metadata, applier, dir.path(), "app");
        (dir, table_manager, index_manager, branch)
    }

    #[test]
    fn create_index_auto_names_from_table_and_columns() {
        let (_dir, tm, im, branch) = setup();
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

        im.create_index(&branch, "widgets", &["label".to_string()], false, None).unwrap();
        let indexes = im.list_indexes(&branch, "widgets").unwrap();
        assert!(indexes.iter().any(|i| i.name == "idx_widgets_label"));
    }

    #[test]
    fn duplicate_index_name_fails() {
        let (_dir, tm, im, branch) = setup();
        tm.create_table(&branch, "widgets", &[]).unwrap();
        im.create_index(&branch, "widgets", &["id".to_string()], false, Some("idx_widgets_id")).unwrap();
        let result = im.create_index(&branch, "widgets", &["id".to_string()], false, Some("idx_widgets_id"));
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn drop_index_removes_it() {
        let (_dir, tm, im, branch) = setup();
        tm.create_table(&branch, "widgets", &[]).unwrap();
        im.create_index(&branch, "widgets", &["id".to_string()], false, Some("idx_widgets_id")).unwrap();
        im.drop_index(&branch, "idx_widgets_id").unwrap();
        assert!(im.list_indexes(&branch, "widgets").unwrap().is_empty());
    }
}
