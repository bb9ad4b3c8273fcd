// src/schema_objects/column.rs

//! Column add/rename directly; drop, type change, and nullability change
//! go through SQLite's copy-rebuild recipe (`CREATE` the replacement,
//! `COPY` the data across, `DROP` the original, `RENAME` into place)
//! since SQLite's own `ALTER TABLE` cannot drop or retype a column.

use super::{
    open_empty_tenant_conn, read_table_info, reject_protected_column_name, table_exists, ColumnDef, ColumnInfo,
};
use crate::change_applier::ChangeApplier;
use crate::change_tracker::ChangeTracker;
use crate::connection::{self, EncryptionConfig};
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change, ChangeType};
use crate::metadata::MetadataStore;
use crate::tenant::TenantManager;
use crate::util::name::validate_name;
use crate::util::path;
use serde_json::Value as Json;
use std::path::PathBuf;
use std::sync::Arc;

pub struct ColumnManager {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    applier: Arc<ChangeApplier>,
    tenants: TenantManager,
    project_root: PathBuf,
    database: String,
}

impl ColumnManager {
    pub fn new(
        metadata: Arc<MetadataStore>,
        applier: Arc<ChangeApplier>,
        tenants: TenantManager,
        project_root: impl Into<PathBuf>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            tracker: ChangeTracker::new(metadata.clone()),
            metadata,
            applier,
            tenants,
            project_root: project_root.into(),
            database: database.into(),
        }
    }

    /// Count of existing rows with a NULL in `column_name`, across every
    /// materialized tenant of `branch` (the `__empty__` template itself
    /// never carries rows, so it can't stand in for real tenant data here).
    fn count_existing_nulls(&self, branch: &Branch, table: &str, column_name: &str) -> Result<i64> {
        let mut total = 0;
        for tenant in self.tenants.list_tenants(&branch.id)? {
            if !tenant.materialized {
                continue;
            }
            let db_path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
            if !db_path.exists() {
                continue;
            }
            let conn = connection::open_existing(&db_path, &EncryptionConfig::disabled())?;
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE {column_name} IS NULL"),
                [],
                |row| row.get(0),
            )?;
            total += count;
        }
        Ok(total)
    }

    fn columns(&self, branch: &Branch, table: &str) -> Result<Vec<ColumnInfo>> {
        let conn = open_empty_tenant_conn(&self.project_root, &self.database, &branch.name)?;
        if !table_exists(&conn, table)? {
            return Err(Error::NotFound {
                entity: "table".to_string(),
                name: table.to_string(),
            });
        }
        read_table_info(&conn, table)
    }

    pub fn list_columns(&self, branch: &Branch, table: &str) -> Result<Vec<ColumnInfo>> {
        self.columns(branch, table)
    }

    pub fn add_column(&self, branch: &Branch, table: &str, column: &ColumnDef) -> Result<Change> {
        validate_name(&column.name, "column")?;
        reject_protected_column_name(&column.name)?;
        let existing = self.columns(branch, table)?;
        if existing.iter().any(|c| c.name == column.name) {
            return Err(Error::AlreadyExists {
                entity: "column".to_string(),
                name: column.name.clone(),
            });
        }
        if !column.nullable && column.default.is_none() {
            return Err(Error::InvalidName(
                "a NOT NULL column added to an existing table needs a DEFAULT".to_string(),
            ));
        }

        let sql = format!("ALTER TABLE {table} ADD COLUMN {}", column.to_sql_fragment());
        let details = serde_json::json!({ "table": table, "column": column.name });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::AddColumn,
            "column",
            &column.name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    pub fn rename_column(&self, branch: &Branch, table: &str, old_name: &str, new_name: &str) -> Result<Change> {
        reject_protected_column_name(old_name)?;
        reject_protected_column_name(new_name)?;
        validate_name(new_name, "column")?;
        let existing = self.columns(branch, table)?;
        if !existing.iter().any(|c| c.name == old_name) {
            return Err(Error::NotFound {
                entity: "column".to_string(),
                name: old_name.to_string(),
            });
        }

        let sql = format!("ALTER TABLE {table} RENAME COLUMN {old_name} TO {new_name}");
        let details = serde_json::json!({ "table": table, "old_name": old_name, "new_name": new_name });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::RenameColumn,
            "column",
            old_name,
            &details,
            Some(&sql),
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    /// Drop a column via the copy-rebuild recipe: a fresh `<table>__new`
    /// without the column, data copied over, the original dropped, the
    /// replacement renamed into place.
    pub fn drop_column(&self, branch: &Branch, table: &str, column_name: &str) -> Result<Change> {
        reject_protected_column_name(column_name)?;
        let existing = self.columns(branch, table)?;
        if !existing.iter().any(|c| c.name == column_name) {
            return Err(Error::NotFound {
                entity: "column".to_string(),
                name: column_name.to_string(),
            });
        }

        let kept: Vec<&ColumnInfo> = existing.iter().filter(|c| c.name != column_name).collect();
        let statements = self.rebuild_statements(table, &kept, None);

        let details = serde_json::json!({
            "table": table,
            "column": column_name,
            "statements": statements,
        });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::DropColumn,
            "column",
            column_name,
            &details,
            None,
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    /// Flip a column's nullability via the same copy-rebuild recipe, since
    /// SQLite cannot alter a column's constraints in place.
    ///
    /// Going from nullable to `NOT NULL` refuses if the table already has
    /// rows with a NULL in that column, unless `fill_value` is supplied --
    /// in which case the copy step substitutes it via `COALESCE`.
    pub fn alter_column_nullable(
        &self,
        branch: &Branch,
        table: &str,
        column_name: &str,
        nullable: bool,
        fill_value: Option<&str>,
    ) -> Result<Change> {
        reject_protected_column_name(column_name)?;
        let existing = self.columns(branch, table)?;
        if !existing.iter().any(|c| c.name == column_name) {
            return Err(Error::NotFound {
                entity: "column".to_string(),
                name: column_name.to_string(),
            });
        }

        if !nullable {
            let null_count = self.count_existing_nulls(branch, table, column_name)?;
            if null_count > 0 && fill_value.is_none() {
                return Err(Error::InvalidName(format!(
                    "column '{column_name}' has {null_count} existing NULL value(s); supply fill_value to proceed"
                )));
            }
        }

        let rebuilt: Vec<ColumnInfo> = existing
            .iter()
            .map(|c| {
                if c.name == column_name {
                    ColumnInfo {
                        notnull: !nullable,
                        ..c.clone()
                    }
                } else {
                    c.clone()
                }
            })
            .collect();
        let refs: Vec<&ColumnInfo> = rebuilt.iter().collect();
        let overrides = fill_value.map(|fv| (column_name.to_string(), format!("COALESCE({column_name}, {fv})")));
        let statements = self.rebuild_statements(table, &refs, overrides.as_ref());

        let details = serde_json::json!({
            "table": table,
            "column": column_name,
            "nullable": nullable,
            "fill_value": fill_value,
            "statements": statements,
        });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::AlterColumnNullable,
            "column",
            column_name,
            &details,
            None,
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    /// Change a column's declared SQL type via the copy-rebuild recipe.
    /// SQLite's dynamic typing means existing data is not itself
    /// converted; a caller that needs coerced values passes `fill_value`
    /// to interpose a `CAST` in the copy step instead of a raw copy.
    pub fn modify_column(&self, branch: &Branch, table: &str, column_name: &str, new_sql_type: &str) -> Result<Change> {
        reject_protected_column_name(column_name)?;
        let existing = self.columns(branch, table)?;
        if !existing.iter().any(|c| c.name == column_name) {
            return Err(Error::NotFound {
                entity: "column".to_string(),
                name: column_name.to_string(),
            });
        }

        let rebuilt: Vec<ColumnInfo> = existing
            .iter()
            .map(|c| {
                if c.name == column_name {
                    ColumnInfo {
                        sql_type: new_sql_type.to_string(),
                        ..c.clone()
                    }
                } else {
                    c.clone()
                }
            })
            .collect();
        let refs: Vec<&ColumnInfo> = rebuilt.iter().collect();
        let overrides = Some((column_name.to_string(), format!("CAST({column_name} AS {new_sql_type})")));
        let statements = self.rebuild_statements(table, &refs, overrides.as_ref());

        let details = serde_json::json!({
            "table": table,
            "column": column_name,
            "sql_type": new_sql_type,
            "statements": statements,
        });
        let change = self.tracker.add_change(
            &branch.database_id,
            &branch.id,
            &branch.name,
            ChangeType::ModifyColumn,
            "column",
            column_name,
            &details,
            None,
        )?;
        self.applier.apply_change(branch, &change)?;
        Ok(change)
    }

    /// `overrides`, when set, is a `(column, select_expr)` pair substituted
    /// for a plain column reference in the `COPY` step -- used to fold in a
    /// `COALESCE`/`CAST` for the column being altered.
    fn rebuild_statements(&self, table: &str, columns: &[&ColumnInfo], overrides: Option<&(String, String)>) -> Json {
        let new_table = format!("{table}__new");
        let column_list: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let select_list: Vec<String> = columns
            .iter()
            .map(|c| match overrides {
                Some((name, expr)) if *name == c.name => expr.clone(),
                _ => c.name.clone(),
            })
            .collect();

        let defs: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", c.name, c.sql_type);
                if c.notnull {
                    def.push_str(" NOT NULL");
                }
                if c.primary_key {
                    def.push_str(" PRIMARY KEY");
                }
                if let Some(default) = &c.default_value {
                    def.push_str(&format!(" DEFAULT {default}"));
                }
                def
            })
            .collect();

        serde_json::json!([
            { "step": "CREATE", "sql": format!("CREATE TABLE {new_table} ({})", defs.join(", ")) },
            { "step": "COPY", "sql": format!(
                "INSERT INTO {new_table} ({cols}) SELECT {select} FROM {table}",
                cols = column_list.join(", "),
                select = select_list.join(", "),
            ) },
            { "step": "DROP", "sql": format!("DROP TABLE {table}") },
            { "step": "RENAME", "sql": format!("ALTER TABLE {new_table} RENAME TO {table}") },
        ])
    }
}
