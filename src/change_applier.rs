// src/change_applier.rs

//! Applies tracked DDL changes to every materialized tenant on a branch.
//!
//! Application is all-or-nothing across tenants: before running a change's
//! SQL anywhere, every materialized tenant file is snapshotted; if any
//! tenant fails, every tenant is restored from its snapshot and the change
//! stays unapplied. While a change is in flight the branch is flagged via a
//! maintenance-mode sentinel file so other processes can detect a change is
//! underway and back off.

use crate::change_tracker::ChangeTracker;
use crate::connection::{self, EncryptionConfig};
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change, TrackedChange};
use crate::metadata::MetadataStore;
use crate::tenant::TenantManager;
use crate::util::path;
use rusqlite::Connection;
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAINTENANCE_SETTLE_DELAY: Duration = Duration::from_millis(250);
const SKIP_DELAY_ENV: &str = "CINCHDB_SKIP_MAINTENANCE_DELAY";

pub struct ChangeApplier {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    tenants: TenantManager,
    project_root: PathBuf,
    database: String,
}

impl ChangeApplier {
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

    fn maintenance_sentinel_path(&self, branch_name: &str) -> PathBuf {
        path::context_root(&self.project_root, &self.database, branch_name).join(".maintenance_mode")
    }

    fn backup_dir(&self, branch_name: &str, change_id: &str) -> PathBuf {
        path::context_root(&self.project_root, &self.database, branch_name)
            .join(".change_backups")
            .join(change_id)
    }

    fn enter_maintenance(&self, branch: &Branch, change: &Change, reason: &str) -> Result<()> {
        self.metadata.set_branch_maintenance(&branch.id, true, Some(reason))?;
        let sentinel = self.maintenance_sentinel_path(&branch.name);
        if let Some(parent) = sentinel.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::json!({
            "branch": branch.name,
            "change_id": change.id,
            "reason": reason,
            "started_at": chrono::Utc::now().to_rfc3339(),
        });
        std::fs::write(&sentinel, serde_json::to_string_pretty(&payload)?)?;

        if std::env::var(SKIP_DELAY_ENV).is_err() {
            std::thread::sleep(MAINTENANCE_SETTLE_DELAY);
        }
        Ok(())
    }

    fn exit_maintenance(&self, branch: &Branch) -> Result<()> {
        self.metadata.set_branch_maintenance(&branch.id, false, None)?;
        let sentinel = self.maintenance_sentinel_path(&branch.name);
        if sentinel.exists() {
            std::fs::remove_file(&sentinel)?;
        }
        Ok(())
    }

    /// Copy `db_path`'s `.db`, `.db-wal`, `.db-shm` into `backup_dir/<tenant>.db[-wal|-shm]`.
    /// Missing WAL/SHM files are tolerated; their absence just means restore
    /// will delete rather than overwrite them.
    fn snapshot_tenant(backup_dir: &Path, tenant_name: &str, db_path: &Path) -> Result<()> {
        std::fs::create_dir_all(backup_dir)?;
        std::fs::copy(db_path, backup_dir.join(format!("{tenant_name}.db")))?;
        for ext in ["db-wal", "db-shm"] {
            let live = db_path.with_extension(ext);
            if live.exists() {
                std::fs::copy(&live, backup_dir.join(format!("{tenant_name}.{ext}")))?;
            }
        }
        Ok(())
    }

    /// Restore a tenant from its backup. Any WAL/SHM absent from the backup
    /// is removed from the live location so a half-written WAL from the
    /// failed attempt is never replayed.
    fn restore_tenant(backup_dir: &Path, tenant_name: &str, db_path: &Path) {
        let backup_db = backup_dir.join(format!("{tenant_name}.db"));
        if backup_db.exists() {
            if let Err(e) = std::fs::copy(&backup_db, db_path) {
                warn!(path = %db_path.display(), error = %e, "failed to restore tenant snapshot");
            }
        }
        for ext in ["db-wal", "db-shm"] {
            let backup_side = backup_dir.join(format!("{tenant_name}.{ext}"));
            let live_side = db_path.with_extension(ext);
            if backup_side.exists() {
                let _ = std::fs::copy(&backup_side, &live_side);
            } else {
                let _ = std::fs::remove_file(&live_side);
            }
        }
    }

    /// Run one change's SQL against a single already-open connection.
    ///
    /// Three shapes, chosen by `change.details`:
    /// - `statements`: an ordered array of `{ "step": "<label>", "sql": "<stmt>" }`
    ///   objects executed inside one `BEGIN ... COMMIT` (used for multi-step
    ///   rebuilds like DROP COLUMN or ALTER COLUMN NULLABLE).
    /// - `copy_sql`: a `CREATE TABLE ... AS SELECT`-style statement paired
    ///   with the change's own `sql`, used for table-copy based changes.
    /// - otherwise: `change.sql` is executed as a single statement.
    fn execute_change_sql(conn: &Connection, change: &Change) -> rusqlite::Result<()> {
        if let Some(steps) = change.details.get("statements").and_then(Json::as_array) {
            conn.execute_batch("BEGIN;")?;
            for step in steps {
                let label = step.get("step").and_then(Json::as_str).unwrap_or("step");
                let sql = step.get("sql").and_then(Json::as_str).unwrap_or("");
                debug!(step = label, "executing change step");
                if let Err(e) = conn.execute_batch(sql) {
                    let _ = conn.execute_batch("ROLLBACK;");
                    return Err(e);
                }
            }
            conn.execute_batch("COMMIT;")?;
            return Ok(());
        }

        if let Some(copy_sql) = change.details.get("copy_sql").and_then(Json::as_str) {
            conn.execute_batch("BEGIN;")?;
            if let Some(sql) = &change.sql {
                if let Err(e) = conn.execute_batch(sql) {
                    let _ = conn.execute_batch("ROLLBACK;");
                    return Err(e);
                }
            }
            if let Err(e) = conn.execute_batch(copy_sql) {
                let _ = conn.execute_batch("ROLLBACK;");
                return Err(e);
            }
            conn.execute_batch("COMMIT;")?;
            return Ok(());
        }

        if let Some(sql) = &change.sql {
            conn.execute_batch(sql)?;
        }
        Ok(())
    }

    /// Apply one change across every materialized tenant on `branch`,
    /// including the `__empty__` template (so future lazy tenants inherit
    /// the new schema).
    pub fn apply_change(&self, branch: &Branch, change: &Change) -> Result<()> {
        let link = self.metadata.get_branch_change_link(&branch.id, &change.id)?;
        if link.map(|l| l.applied).unwrap_or(false) {
            debug!(change_id = change.id, branch = branch.name, "change already applied, skipping");
            return Ok(());
        }

        if self.metadata.is_branch_in_maintenance(&branch.id)? {
            return Err(Error::MaintenanceMode {
                branch: branch.name.clone(),
                reason: "a change is already being applied".to_string(),
            });
        }

        self.enter_maintenance(branch, change, &format!("applying change {}", change.id))?;
        let result = self.apply_change_locked(branch, change);
        self.exit_maintenance(branch)?;
        result
    }

    fn apply_change_locked(&self, branch: &Branch, change: &Change) -> Result<()> {
        // DDL must land on every tenant, including ones that are still lazy,
        // so a later materialization can't hand back stale schema.
        let mut tenants = self.tenants.list_tenants(&branch.id)?;
        let empty_tenant = self
            .metadata
            .get_tenant(&branch.id, path::EMPTY_TENANT)?
            .ok_or_else(|| Error::CatalogError("branch is missing its __empty__ tenant".to_string()))?;
        tenants.push(empty_tenant);
        for tenant in &tenants {
            if !tenant.materialized {
                self.tenants.materialize_tenant(branch, tenant)?;
            }
        }

        let backup_dir = self.backup_dir(&branch.name, &change.id);
        let mut snapshotted: Vec<(String, PathBuf)> = Vec::new();
        for tenant in &tenants {
            let db_path = path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?;
            if !db_path.exists() {
                continue;
            }
            if let Err(e) = Self::snapshot_tenant(&backup_dir, &tenant.name, &db_path) {
                self.rollback_snapshots(&backup_dir, &snapshotted);
                return Err(e);
            }
            snapshotted.push((tenant.name.clone(), db_path));
        }

        for (_, db_path) in &snapshotted {
            let outcome = connection::open_existing(db_path, &EncryptionConfig::disabled())
                .and_then(|conn| Self::execute_change_sql(&conn, change).map_err(Error::from));

            if let Err(cause) = outcome {
                error!(change_id = change.id, path = %db_path.display(), error = %cause, "change failed, rolling back");
                self.rollback_snapshots(&backup_dir, &snapshotted);
                return Err(Error::ChangeError {
                    change_id: change.id.clone(),
                    tenant: db_path.display().to_string(),
                    cause: cause.to_string(),
                });
            }
        }

        let _ = std::fs::remove_dir_all(&backup_dir);
        self.tracker.mark_applied(&branch.id, &change.id)?;
        info!(change_id = change.id, branch = branch.name, tenants = snapshotted.len(), "change applied");
        Ok(())
    }

    /// Best-effort: restoring one tenant's files never stops the others
    /// from being restored.
    fn rollback_snapshots(&self, backup_dir: &Path, applied: &[(String, PathBuf)]) {
        for (tenant_name, db_path) in applied {
            Self::restore_tenant(backup_dir, tenant_name, db_path);
        }
        let _ = std::fs::remove_dir_all(backup_dir);
    }

    /// Apply every unapplied change on a branch, in `applied_order`. Stops
    /// at the first failure, leaving later changes unapplied.
    pub fn apply_all_unapplied(&self, branch: &Branch) -> Result<usize> {
        let pending = self.tracker.get_unapplied_changes(&branch.id)?;
        let mut applied = 0;
        for tracked in &pending {
            self.apply_change(branch, &tracked.change)?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Apply every change linked after `since_order`, in order.
    pub fn apply_changes_since(&self, branch: &Branch, since_order: i64) -> Result<Vec<TrackedChange>> {
        let changes = self.tracker.get_changes_since(&branch.id, since_order)?;
        for tracked in &changes {
            if !tracked.applied {
                self.apply_change(branch, &tracked.change)?;
            }
        }
        Ok(changes)
    }

    /// Syntactic/idempotency pre-check run before a change is even tracked:
    /// rejects empty SQL and changes with neither `sql` nor `statements`.
    pub fn validate_change(&self, change: &Change) -> Result<()> {
        let has_sql = change.sql.as_deref().is_some_and(|s| !s.trim().is_empty());
        let has_statements = change
            .details
            .get("statements")
            .and_then(Json::as_array)
            .is_some_and(|a| !a.is_empty());
        if !has_sql && !has_statements {
            return Err(Error::ChangeError {
                change_id: change.id.clone(),
                tenant: "*".to_string(),
                cause: "change carries no SQL to apply".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::models::ChangeType;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, ChangeApplier, Branch) {
        std::env::set_var(SKIP_DELAY_ENV, "1");
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
        let applier = ChangeApplier::new(metadata, tracker, tenants, dir.path(), "app");
        (dir, applier, branch)
    }

    #[test]
    fn apply_change_runs_sql_on_all_materialized_tenants() {
        let (_dir, applier, branch) = setup();
        let change = applier
            .metadata
            .create_change(
                &branch.database_id,
                Some(&branch.id),
                Some(&branch.name),
                ChangeType::CreateTable,
                "table",
                "widgets",
                &Json::Object(Default::default()),
                Some("CREATE TABLE widgets (id TEXT PRIMARY KEY)"),
            )
            .unwrap();
        applier.metadata.link_change_to_branch(&branch.id, &branch.name, &change.id, false, None).unwrap();

        applier.apply_change(&branch, &change).unwrap();

        let main_path = path::tenant_db_path(&applier.project_root, &applier.database, &branch.name, "main").unwrap();
        let conn = connection::open_existing(&main_path, &EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'widgets'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);

        let empty_path = path::tenant_db_path(&applier.project_root, &applier.database, &branch.name, path::EMPTY_TENANT).unwrap();
        let conn = connection::open_existing(&empty_path, &EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'widgets'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1, "the __empty__ template must also receive the change");
    }

    #[test]
    fn reapplying_an_already_applied_change_is_a_no_op() {
        let (_dir, applier, branch) = setup();
        let change = applier
            .metadata
            .create_change(
                &branch.database_id,
                Some(&branch.id),
                Some(&branch.name),
                ChangeType::CreateTable,
                "table",
                "widgets",
                &Json::Object(Default::default()),
                Some("CREATE TABLE widgets (id TEXT PRIMARY KEY)"),
            )
            .unwrap();
        applier.metadata.link_change_to_branch(&branch.id, &branch.name, &change.id, false, None).unwrap();

        applier.apply_change(&branch, &change).unwrap();
        // The SQL would fail with "table already exists" if re-executed;
        // a second call must short-circuit on the applied flag instead.
        applier.apply_change(&branch, &change).unwrap();
    }

    #[test]
    fn failing_sql_rolls_back_and_leaves_change_unapplied() {
        let (_dir, applier, branch) = setup();
        let change = applier
            .metadata
            .create_change(
                &branch.database_id,
                Some(&branch.id),
                Some(&branch.name),
                ChangeType::CreateTable,
                "table",
                "broken",
                &Json::Object(Default::default()),
                Some("CREATE TABLE broken (id TEXT PRIMARY KEY); SYNTAX ERROR HERE;"),
            )
            .unwrap();
        applier.metadata.link_change_to_branch(&branch.id, &branch.name, &change.id, false, None).unwrap();

        let result = applier.apply_change(&branch, &change);
        assert!(result.is_err());

        assert!(!applier.metadata.is_branch_in_maintenance(&branch.id).unwrap());

        let main_path = path::tenant_db_path(&applier.project_root, &applier.database, &branch.name, "main").unwrap();
        let conn = connection::open_existing(&main_path, &EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'broken'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "failed change must not leave a partial table behind");
    }

    #[test]
    fn multi_statement_change_executes_labeled_steps() {
        let (_dir, applier, branch) = setup();
        let details = serde_json::json!({
            "statements": [
                { "step": "CREATE", "sql": "CREATE TABLE widgets_new (id TEXT PRIMARY KEY, name TEXT)" },
                { "step": "COPY", "sql": "INSERT INTO widgets_new (id) SELECT id FROM widgets_new" },
                { "step": "DROP", "sql": "DROP TABLE IF EXISTS widgets" },
                { "step": "RENAME", "sql": "ALTER TABLE widgets_new RENAME TO widgets" }
            ]
        });
        let change = applier
            .metadata
            .create_change(
                &branch.database_id,
                Some(&branch.id),
                Some(&branch.name),
                ChangeType::AddColumn,
                "table",
                "widgets",
                &details,
                None,
            )
            .unwrap();
        applier.metadata.link_change_to_branch(&branch.id, &branch.name, &change.id, false, None).unwrap();

        applier.apply_change(&branch, &change).unwrap();

        let main_path = path::tenant_db_path(&applier.project_root, &applier.database, &branch.name, "main").unwrap();
        let conn = connection::open_existing(&main_path, &EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'widgets'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
