// src/metadata/mod.rs

//! The metadata catalog: a single embedded SQLite database
//! (`.cinchdb/metadata.db`) that is the authoritative record of every
//! database, branch, tenant, and change. All other managers go through
//! [`MetadataStore`] rather than touching `metadata.db` directly.

pub mod models;
pub mod schema;

use crate::connection::{self, EncryptionConfig};
use crate::error::{Error, Result};
use models::{Branch, BranchChange, Change, ChangeType, Database, Tenant, TrackedChange};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn json_text(value: &Json) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

/// Maintenance-mode payload: whether a pause is active, and why.
#[derive(Debug, Clone)]
pub struct MaintenanceInfo {
    pub active: bool,
    pub reason: Option<String>,
    pub started_at: Option<String>,
}

/// The authoritative catalog of databases, branches, tenants and changes.
///
/// Holds one pooled writer connection; SQLite's own locking combined with
/// the internal `Mutex` serializes concurrent access from this process.
pub struct MetadataStore {
    conn: Mutex<Connection>,
    #[allow(dead_code)]
    path: PathBuf,
}

impl MetadataStore {
    /// Open (creating if necessary) the catalog at `<project_root>/.cinchdb/metadata.db`.
    pub fn open(project_root: &Path) -> Result<Self> {
        let path = crate::util::path::metadata_db_path(project_root);
        let conn = connection::open(&path, &EncryptionConfig::disabled())?;
        schema::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn catalog_err(cause: rusqlite::Error) -> Error {
        Error::CatalogError(cause.to_string())
    }

    // ---------------------------------------------------------------
    // Databases
    // ---------------------------------------------------------------

    pub fn create_database(&self, name: &str, description: Option<&str>) -> Result<Database> {
        let conn = self.conn.lock().unwrap();
        let id = new_id();
        let ts = now();
        conn.execute(
            "INSERT INTO databases (id, name, description, materialized, maintenance_mode, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, 0, ?4, ?5, ?5)",
            params![id, name, description, json_text(&Json::Object(Default::default())), ts],
        )
        .map_err(|e| {
            if matches!(e, rusqlite::Error::SqliteFailure(ref err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) {
                Error::AlreadyExists {
                    entity: "database".to_string(),
                    name: name.to_string(),
                }
            } else {
                Self::catalog_err(e)
            }
        })?;
        info!(database = name, "created database");
        self.get_database_by_id_conn(&conn, &id)?
            .ok_or_else(|| Error::CatalogError("database vanished after insert".into()))
    }

    fn get_database_by_id_conn(&self, conn: &Connection, id: &str) -> Result<Option<Database>> {
        conn.query_row(
            "SELECT * FROM databases WHERE id = ?1",
            params![id],
            Database::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn get_database(&self, name: &str) -> Result<Option<Database>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM databases WHERE name = ?1",
            params![name],
            Database::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn get_database_by_id(&self, id: &str) -> Result<Option<Database>> {
        let conn = self.conn.lock().unwrap();
        self.get_database_by_id_conn(&conn, id)
    }

    pub fn list_databases(&self, materialized_only: bool) -> Result<Vec<Database>> {
        let conn = self.conn.lock().unwrap();
        let sql = if materialized_only {
            "SELECT * FROM databases WHERE materialized = 1 ORDER BY name"
        } else {
            "SELECT * FROM databases ORDER BY name"
        };
        let mut stmt = conn.prepare(sql).map_err(Self::catalog_err)?;
        let rows = stmt
            .query_map([], Database::from_row)
            .map_err(Self::catalog_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::catalog_err)?;
        Ok(rows)
    }

    pub fn mark_database_materialized(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE databases SET materialized = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn delete_database(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM databases WHERE id = ?1", params![id])
            .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn set_database_maintenance(
        &self,
        database_id: &str,
        enabled: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if enabled {
            conn.execute(
                "UPDATE databases SET maintenance_mode = 1, maintenance_reason = ?2,
                 maintenance_started_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![database_id, reason, now()],
            )
        } else {
            conn.execute(
                "UPDATE databases SET maintenance_mode = 0, maintenance_reason = NULL,
                 maintenance_started_at = NULL, updated_at = ?2 WHERE id = ?1",
                params![database_id, now()],
            )
        }
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn is_database_in_maintenance(&self, database_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT maintenance_mode FROM databases WHERE id = ?1",
            params![database_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(Self::catalog_err)
        .map(|v| v.unwrap_or(0) != 0)
    }

    // ---------------------------------------------------------------
    // Branches
    // ---------------------------------------------------------------

    pub fn create_branch(
        &self,
        database_id: &str,
        name: &str,
        parent_branch: Option<&str>,
    ) -> Result<Branch> {
        let conn = self.conn.lock().unwrap();
        let id = new_id();
        let ts = now();
        conn.execute(
            "INSERT INTO branches (id, database_id, name, parent_branch, materialized,
             maintenance_mode, cdc_enabled, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, 0, 0, ?5, ?6, ?6)",
            params![id, database_id, name, parent_branch, json_text(&Json::Object(Default::default())), ts],
        )
        .map_err(|e| {
            if matches!(e, rusqlite::Error::SqliteFailure(ref err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) {
                Error::AlreadyExists {
                    entity: "branch".to_string(),
                    name: name.to_string(),
                }
            } else {
                Self::catalog_err(e)
            }
        })?;
        info!(branch = name, "created branch");
        self.get_branch_by_id_conn(&conn, &id)?
            .ok_or_else(|| Error::CatalogError("branch vanished after insert".into()))
    }

    fn get_branch_by_id_conn(&self, conn: &Connection, id: &str) -> Result<Option<Branch>> {
        conn.query_row(
            "SELECT * FROM branches WHERE id = ?1",
            params![id],
            Branch::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn get_branch_by_id(&self, id: &str) -> Result<Option<Branch>> {
        let conn = self.conn.lock().unwrap();
        self.get_branch_by_id_conn(&conn, id)
    }

    pub fn get_branch(&self, database_id: &str, name: &str) -> Result<Option<Branch>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM branches WHERE database_id = ?1 AND name = ?2 AND archived_at IS NULL",
            params![database_id, name],
            Branch::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn list_branches(&self, database_id: &str, materialized_only: bool) -> Result<Vec<Branch>> {
        let conn = self.conn.lock().unwrap();
        let sql = if materialized_only {
            "SELECT * FROM branches WHERE database_id = ?1 AND archived_at IS NULL AND materialized = 1 ORDER BY name"
        } else {
            "SELECT * FROM branches WHERE database_id = ?1 AND archived_at IS NULL ORDER BY name"
        };
        let mut stmt = conn.prepare(sql).map_err(Self::catalog_err)?;
        let rows = stmt
            .query_map(params![database_id], Branch::from_row)
            .map_err(Self::catalog_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::catalog_err)?;
        Ok(rows)
    }

    pub fn mark_branch_materialized(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE branches SET materialized = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    /// Archive a branch (soft-delete) and hard-delete its tenant rows, in
    /// one transaction. `delete_branch` is an alias for this.
    pub fn archive_branch(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(Self::catalog_err)?;
        tx.execute(
            "UPDATE branches SET archived_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )
        .map_err(Self::catalog_err)?;
        tx.execute("DELETE FROM tenants WHERE branch_id = ?1", params![id])
            .map_err(Self::catalog_err)?;
        tx.commit().map_err(Self::catalog_err)?;
        info!(branch_id = id, "archived branch and deleted its tenant rows");
        Ok(())
    }

    pub fn delete_branch(&self, id: &str) -> Result<()> {
        self.archive_branch(id)
    }

    pub fn set_branch_maintenance(
        &self,
        branch_id: &str,
        enabled: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        if enabled {
            conn.execute(
                "UPDATE branches SET maintenance_mode = 1, maintenance_reason = ?2,
                 maintenance_started_at = ?3, updated_at = ?3 WHERE id = ?1",
                params![branch_id, reason, now()],
            )
        } else {
            conn.execute(
                "UPDATE branches SET maintenance_mode = 0, maintenance_reason = NULL,
                 maintenance_started_at = NULL, updated_at = ?2 WHERE id = ?1",
                params![branch_id, now()],
            )
        }
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn is_branch_in_maintenance(&self, branch_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT maintenance_mode FROM branches WHERE id = ?1",
            params![branch_id],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(Self::catalog_err)
        .map(|v| v.unwrap_or(0) != 0)
    }

    pub fn get_maintenance_info(&self, branch_id: &str) -> Result<Option<MaintenanceInfo>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT maintenance_mode, maintenance_reason, maintenance_started_at FROM branches WHERE id = ?1",
            params![branch_id],
            |row| {
                Ok(MaintenanceInfo {
                    active: row.get::<_, i64>(0)? != 0,
                    reason: row.get(1)?,
                    started_at: row.get(2)?,
                })
            },
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    // ---------------------------------------------------------------
    // Tenants
    // ---------------------------------------------------------------

    pub fn create_tenant(&self, branch_id: &str, name: &str, shard: &str) -> Result<Tenant> {
        let conn = self.conn.lock().unwrap();
        let id = new_id();
        let ts = now();
        conn.execute(
            "INSERT INTO tenants (id, branch_id, name, shard, materialized, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)",
            params![id, branch_id, name, shard, json_text(&Json::Object(Default::default())), ts],
        )
        .map_err(|e| {
            if matches!(e, rusqlite::Error::SqliteFailure(ref err, _) if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE) {
                Error::AlreadyExists {
                    entity: "tenant".to_string(),
                    name: name.to_string(),
                }
            } else {
                Self::catalog_err(e)
            }
        })?;
        debug!(tenant = name, "created tenant catalog row");
        self.get_tenant_by_id_conn(&conn, &id)?
            .ok_or_else(|| Error::CatalogError("tenant vanished after insert".into()))
    }

    fn get_tenant_by_id_conn(&self, conn: &Connection, id: &str) -> Result<Option<Tenant>> {
        conn.query_row(
            "SELECT * FROM tenants WHERE id = ?1",
            params![id],
            Tenant::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn get_tenant(&self, branch_id: &str, name: &str) -> Result<Option<Tenant>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM tenants WHERE branch_id = ?1 AND name = ?2",
            params![branch_id, name],
            Tenant::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn list_tenants(&self, branch_id: &str, materialized_only: bool) -> Result<Vec<Tenant>> {
        let conn = self.conn.lock().unwrap();
        let sql = if materialized_only {
            "SELECT * FROM tenants WHERE branch_id = ?1 AND materialized = 1 ORDER BY name"
        } else {
            "SELECT * FROM tenants WHERE branch_id = ?1 ORDER BY name"
        };
        let mut stmt = conn.prepare(sql).map_err(Self::catalog_err)?;
        let rows = stmt
            .query_map(params![branch_id], Tenant::from_row)
            .map_err(Self::catalog_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::catalog_err)?;
        Ok(rows)
    }

    pub fn mark_tenant_materialized(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tenants SET materialized = 1, updated_at = ?2 WHERE id = ?1",
            params![id, now()],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn delete_tenant(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tenants WHERE id = ?1", params![id])
            .map_err(Self::catalog_err)?;
        Ok(())
    }

    pub fn rename_tenant(&self, id: &str, new_name: &str, new_shard: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE tenants SET name = ?2, shard = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, new_name, new_shard, now()],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Changes
    // ---------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn create_change(
        &self,
        database_id: &str,
        origin_branch_id: Option<&str>,
        origin_branch_name: Option<&str>,
        change_type: ChangeType,
        entity_type: &str,
        entity_name: &str,
        details: &Json,
        sql: Option<&str>,
    ) -> Result<Change> {
        let conn = self.conn.lock().unwrap();
        let id = new_id();
        let ts = now();
        conn.execute(
            "INSERT INTO changes (id, database_id, origin_branch_id, origin_branch_name, type,
             entity_type, entity_name, details, sql, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                id,
                database_id,
                origin_branch_id,
                origin_branch_name,
                change_type.as_str(),
                entity_type,
                entity_name,
                json_text(details),
                sql,
                ts
            ],
        )
        .map_err(Self::catalog_err)?;
        conn.query_row(
            "SELECT * FROM changes WHERE id = ?1",
            params![id],
            Change::from_row,
        )
        .map_err(Self::catalog_err)
    }

    pub fn get_change(&self, id: &str) -> Result<Option<Change>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM changes WHERE id = ?1",
            params![id],
            Change::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    /// Attach `change_id` to a branch's ordered history. If
    /// `copied_from` is set, it is recorded so merges/branch-copies can be
    /// traced back to their origin.
    pub fn link_change_to_branch(
        &self,
        branch_id: &str,
        branch_name: &str,
        change_id: &str,
        applied: bool,
        copied_from: Option<(&str, &str)>,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let next_order = Self::next_applied_order_conn(&conn, branch_id)?;
        conn.execute(
            "INSERT INTO branch_changes (branch_id, branch_name, change_id, applied, applied_order,
             copied_from_branch_id, copied_from_branch_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                branch_id,
                branch_name,
                change_id,
                applied as i64,
                next_order,
                copied_from.map(|c| c.0),
                copied_from.map(|c| c.1),
            ],
        )
        .map_err(Self::catalog_err)?;
        Ok(next_order)
    }

    fn next_applied_order_conn(conn: &Connection, branch_id: &str) -> Result<i64> {
        let max: Option<i64> = conn
            .query_row(
                "SELECT MAX(applied_order) FROM branch_changes WHERE branch_id = ?1",
                params![branch_id],
                |row| row.get(0),
            )
            .map_err(Self::catalog_err)?;
        Ok(max.map(|m| m + 1).unwrap_or(0))
    }

    /// All changes linked to a branch, strictly ordered by `applied_order`.
    pub fn get_branch_changes(&self, branch_id: &str) -> Result<Vec<TrackedChange>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT c.*, bc.applied as bc_applied, bc.applied_order as bc_applied_order
                 FROM branch_changes bc
                 JOIN changes c ON bc.change_id = c.id
                 WHERE bc.branch_id = ?1
                 ORDER BY bc.applied_order ASC",
            )
            .map_err(Self::catalog_err)?;
        let rows = stmt
            .query_map(params![branch_id], |row| {
                let change = Change::from_row(row)?;
                let applied: i64 = row.get("bc_applied")?;
                let applied_order: i64 = row.get("bc_applied_order")?;
                Ok(TrackedChange {
                    change,
                    applied: applied != 0,
                    applied_order,
                })
            })
            .map_err(Self::catalog_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::catalog_err)?;
        Ok(rows)
    }

    pub fn get_branch_change_link(&self, branch_id: &str, change_id: &str) -> Result<Option<BranchChange>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM branch_changes WHERE branch_id = ?1 AND change_id = ?2",
            params![branch_id, change_id],
            BranchChange::from_row,
        )
        .optional()
        .map_err(Self::catalog_err)
    }

    pub fn mark_change_applied(&self, branch_id: &str, change_id: &str) -> Result<()> {
        self.update_change_applied_status(branch_id, change_id, true)
    }

    pub fn update_change_applied_status(
        &self,
        branch_id: &str,
        change_id: &str,
        applied: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE branch_changes SET applied = ?3 WHERE branch_id = ?1 AND change_id = ?2",
            params![branch_id, change_id, applied as i64],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    /// Unlink a change from a branch (does not delete the `changes` row or
    /// undo already-applied DDL -- see `spec.md` §9 Open Questions).
    pub fn unlink_change_from_branch(&self, branch_id: &str, change_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM branch_changes WHERE branch_id = ?1 AND change_id = ?2",
            params![branch_id, change_id],
        )
        .map_err(Self::catalog_err)?;
        Ok(())
    }

    /// Copy every `branch_changes` row from `source_branch_id` to
    /// `target_branch_id`, preserving order and the `applied` flag, and
    /// recording `copied_from`.
    pub fn copy_branch_changes(
        &self,
        source_branch_id: &str,
        source_branch_name: &str,
        target_branch_id: &str,
        target_branch_name: &str,
    ) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT change_id, applied, applied_order FROM branch_changes
                 WHERE branch_id = ?1 ORDER BY applied_order ASC",
            )
            .map_err(Self::catalog_err)?;
        let rows: Vec<(String, i64, i64)> = stmt
            .query_map(params![source_branch_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(Self::catalog_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Self::catalog_err)?;
        drop(stmt);

        let count = rows.len();
        for (change_id, applied, applied_order) in rows {
            conn.execute(
                "INSERT INTO branch_changes (branch_id, branch_name, change_id, applied, applied_order,
                 copied_from_branch_id, copied_from_branch_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    target_branch_id,
                    target_branch_name,
                    change_id,
                    applied,
                    applied_order,
                    source_branch_id,
                    source_branch_name,
                ],
            )
            .map_err(Self::catalog_err)?;
        }
        info!(
            from = source_branch_name,
            to = target_branch_name,
            count,
            "copied branch change history"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, MetadataStore) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_get_database() {
        let (_dir, store) = store();
        let db = store.create_database("app", Some("desc")).unwrap();
        assert_eq!(db.name, "app");
        assert!(!db.materialized);

        let fetched = store.get_database("app").unwrap().unwrap();
        assert_eq!(fetched.id, db.id);
    }

    #[test]
    fn create_database_duplicate_fails() {
        let (_dir, store) = store();
        store.create_database("app", None).unwrap();
        let result = store.create_database("app", None);
        assert!(matches!(result, Err(Error::AlreadyExists { .. })));
    }

    #[test]
    fn get_missing_returns_none() {
        let (_dir, store) = store();
        assert!(store.get_database("missing").unwrap().is_none());
    }

    #[test]
    fn branch_and_tenant_lifecycle() {
        let (_dir, store) = store();
        let db = store.create_database("app", None).unwrap();
        let branch = store.create_branch(&db.id, "main", None).unwrap();
        assert_eq!(branch.name, "main");

        let tenant = store.create_tenant(&branch.id, "main", "aa").unwrap();
        assert!(!tenant.materialized);

        store.mark_tenant_materialized(&tenant.id).unwrap();
        let tenants = store.list_tenants(&branch.id, false).unwrap();
        assert_eq!(tenants.len(), 1);
        assert!(tenants[0].materialized);
    }

    #[test]
    fn archive_branch_hard_deletes_tenants() {
        let (_dir, store) = store();
        let db = store.create_database("app", None).unwrap();
        let branch = store.create_branch(&db.id, "feature", Some("main")).unwrap();
        store.create_tenant(&branch.id, "t1", "aa").unwrap();

        store.archive_branch(&branch.id).unwrap();

        assert!(store.get_branch(&db.id, "feature").unwrap().is_none());
        assert!(store.list_tenants(&branch.id, false).unwrap().is_empty());
    }

    #[test]
    fn archived_branch_name_can_be_reused() {
        let (_dir, store) = store();
        let db = store.create_database("app", None).unwrap();
        let b1 = store.create_branch(&db.id, "feature", Some("main")).unwrap();
        store.archive_branch(&b1.id).unwrap();

        let b2 = store.create_branch(&db.id, "feature", Some("main"));
        assert!(b2.is_ok());
    }

    #[test]
    fn change_tracking_order_is_dense() {
        let (_dir, store) = store();
        let db = store.create_database("app", None).unwrap();
        let branch = store.create_branch(&db.id, "main", None).unwrap();

        let c1 = store
            .create_change(&db.id, Some(&branch.id), Some("main"), ChangeType::CreateTable, "table", "t1", &Json::Object(Default::default()), Some("CREATE TABLE t1 (x)"))
            .unwrap();
        let c2 = store
            .create_change(&db.id, Some(&branch.id), Some("main"), ChangeType::CreateTable, "table", "t2", &Json::Object(Default::default()), Some("CREATE TABLE t2 (x)"))
            .unwrap();

        store.link_change_to_branch(&branch.id, "main", &c1.id, false, None).unwrap();
        store.link_change_to_branch(&branch.id, "main", &c2.id, false, None).unwrap();

        let changes = store.get_branch_changes(&branch.id).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].applied_order, 0);
        assert_eq!(changes[1].applied_order, 1);
        assert_eq!(changes[0].change.id, c1.id);
    }

    #[test]
    fn copy_branch_changes_preserves_order_and_applied_flag() {
        let (_dir, store) = store();
        let db = store.create_database("app", None).unwrap();
        let main = store.create_branch(&db.id, "main", None).unwrap();

        let c1 = store
            .create_change(&db.id, Some(&main.id), Some("main"), ChangeType::CreateTable, "table", "t1", &Json::Object(Default::default()), Some("sql"))
            .unwrap();
        store.link_change_to_branch(&main.id, "main", &c1.id, true, None).unwrap();

        let feature = store.create_branch(&db.id, "feature", Some("main")).unwrap();
        store
            .copy_branch_changes(&main.id, "main", &feature.id, "feature")
            .unwrap();

        let copied = store.get_branch_changes(&feature.id).unwrap();
        assert_eq!(copied.len(), 1);
        assert!(copied[0].applied);
        assert_eq!(copied[0].applied_order, 0);
    }
}
