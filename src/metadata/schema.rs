// src/metadata/schema.rs

//! Schema for the metadata catalog (`metadata.db`).
//!
//! One `CREATE TABLE IF NOT EXISTS` pass, not a version-gated migration
//! chain: `spec.md` describes `Branch.schema_version` as a per-branch tag
//! the engine stamps, not a counter the catalog itself migrates through.

use crate::error::Result;
use rusqlite::Connection;
use tracing::debug;

/// Create every catalog table and index if they don't already exist.
pub fn init(conn: &Connection) -> Result<()> {
    debug!("creating metadata catalog schema");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS databases (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            materialized INTEGER NOT NULL DEFAULT 0,
            maintenance_mode INTEGER NOT NULL DEFAULT 0,
            maintenance_reason TEXT,
            maintenance_started_at TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            id TEXT PRIMARY KEY,
            database_id TEXT NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            parent_branch TEXT,
            schema_version TEXT,
            materialized INTEGER NOT NULL DEFAULT 0,
            maintenance_mode INTEGER NOT NULL DEFAULT 0,
            maintenance_reason TEXT,
            maintenance_started_at TEXT,
            cdc_enabled INTEGER NOT NULL DEFAULT 0,
            archived_at TEXT,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_branches_active_name
        ON branches(database_id, name) WHERE archived_at IS NULL;

        CREATE INDEX IF NOT EXISTS idx_branches_database ON branches(database_id);

        CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL REFERENCES branches(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            shard TEXT NOT NULL,
            materialized INTEGER NOT NULL DEFAULT 0,
            metadata TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(branch_id, name)
        );

        CREATE INDEX IF NOT EXISTS idx_tenants_branch ON tenants(branch_id);

        CREATE TABLE IF NOT EXISTS changes (
            id TEXT PRIMARY KEY,
            database_id TEXT NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
            origin_branch_id TEXT,
            origin_branch_name TEXT,
            type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            details TEXT,
            sql TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_changes_database ON changes(database_id);

        CREATE TABLE IF NOT EXISTS branch_changes (
            branch_id TEXT NOT NULL REFERENCES branches(id) ON DELETE CASCADE,
            branch_name TEXT NOT NULL,
            change_id TEXT NOT NULL REFERENCES changes(id) ON DELETE CASCADE,
            applied INTEGER NOT NULL DEFAULT 0,
            applied_order INTEGER NOT NULL,
            copied_from_branch_id TEXT,
            copied_from_branch_name TEXT,
            PRIMARY KEY (branch_id, change_id)
        );

        CREATE INDEX IF NOT EXISTS idx_branch_changes_order
        ON branch_changes(branch_id, applied_order);

        CREATE INDEX IF NOT EXISTS idx_branch_changes_applied
        ON branch_changes(branch_id, applied);
        ",
    )?;

    debug!("metadata catalog schema ready");
    Ok(())
}
