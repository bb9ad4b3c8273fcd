// src/schema_objects/mod.rs

//! Table, column, view and index managers: the DDL surface that produces
//! tracked [`crate::metadata::models::Change`]s and runs them through
//! [`crate::change_applier::ChangeApplier`]. Each manager reads the
//! branch's current schema off the `__empty__` template tenant, since it
//! always exists and always carries the branch's full, up-to-date schema.

pub mod column;
pub mod index;
pub mod table;
pub mod view;

use crate::error::{Error, Result};

/// Columns every table gets automatically and that no caller may name,
/// drop, rename, or redefine directly.
pub const PROTECTED_COLUMNS: &[&str] = &["id", "created_at", "updated_at"];

/// Table name prefixes reserved for the engine and for SQLite itself.
pub const PROTECTED_TABLE_PREFIXES: &[&str] = &["__", "sqlite_"];

pub fn reject_protected_table_name(name: &str) -> Result<()> {
    if PROTECTED_TABLE_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return Err(Error::ProtectedEntity(format!(
            "table name '{name}' uses a reserved prefix"
        )));
    }
    Ok(())
}

pub fn reject_protected_column_name(name: &str) -> Result<()> {
    if PROTECTED_COLUMNS.contains(&name) {
        return Err(Error::ProtectedEntity(format!(
            "column '{name}' is managed automatically and cannot be redefined"
        )));
    }
    Ok(())
}

/// A column definition as supplied by a caller creating a table or adding
/// a column. `id`, `created_at`, `updated_at` are appended by
/// [`table::TableManager::create_table`] itself and must not appear here.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub nullable: bool,
    pub unique: bool,
    pub default: Option<String>,
    pub foreign_key: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

impl ColumnDef {
    pub fn to_sql_fragment(&self) -> String {
        let mut parts = vec![format!("{} {}", self.name, self.sql_type)];
        if !self.nullable {
            parts.push("NOT NULL".to_string());
        }
        if self.unique {
            parts.push("UNIQUE".to_string());
        }
        if let Some(default) = &self.default {
            parts.push(format!("DEFAULT {default}"));
        }
        if let Some(fk) = &self.foreign_key {
            parts.push(format!("REFERENCES {}({})", fk.table, fk.column));
        }
        parts.join(" ")
    }
}

/// One row of `PRAGMA table_info`.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub sql_type: String,
    pub notnull: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

pub(crate) fn read_table_info(conn: &rusqlite::Connection, table: &str) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get("name")?,
                sql_type: row.get("type")?,
                notnull: row.get::<_, i64>("notnull")? != 0,
                default_value: row.get("dflt_value")?,
                primary_key: row.get::<_, i64>("pk")? != 0,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub(crate) fn table_exists(conn: &rusqlite::Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Validate a `ForeignKeyRef` against the branch's current schema: the
/// referenced table and column must both already exist.
pub(crate) fn validate_foreign_key(conn: &rusqlite::Connection, fk: &ForeignKeyRef) -> Result<()> {
    if !table_exists(conn, &fk.table)? {
        return Err(Error::ForeignKeyInvalid {
            table: fk.table.clone(),
            column: fk.column.clone(),
        });
    }
    let columns = read_table_info(conn, &fk.table)?;
    if !columns.iter().any(|c| c.name == fk.column) {
        return Err(Error::ForeignKeyInvalid {
            table: fk.table.clone(),
            column: fk.column.clone(),
        });
    }
    Ok(())
}

/// Open a read connection to a branch's `__empty__` template, the
/// always-present tenant schema managers consult to learn "what does this
/// branch's schema currently look like".
pub(crate) fn open_empty_tenant_conn(
    project_root: &std::path::Path,
    database: &str,
    branch_name: &str,
) -> Result<rusqlite::Connection> {
    let path = crate::util::path::tenant_db_path(project_root, database, branch_name, crate::util::path::EMPTY_TENANT)?;
    crate::connection::open_existing(&path, &crate::connection::EncryptionConfig::disabled())
}
