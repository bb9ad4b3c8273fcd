// src/metadata/models.rs

//! Catalog row types: databases, branches, tenants, changes, and the
//! branch/change link table. Each type mirrors one table from
//! `schema.rs` and knows how to read itself from a `rusqlite::Row`.

use rusqlite::Row;
use serde_json::Value as Json;
use std::str::FromStr;

fn empty_json() -> Json {
    Json::Object(serde_json::Map::new())
}

#[derive(Debug, Clone)]
pub struct Database {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub materialized: bool,
    pub maintenance_mode: bool,
    pub maintenance_reason: Option<String>,
    pub maintenance_started_at: Option<String>,
    pub metadata: Json,
    pub created_at: String,
    pub updated_at: String,
}

impl Database {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            description: row.get("description")?,
            materialized: row.get::<_, i64>("materialized")? != 0,
            maintenance_mode: row.get::<_, i64>("maintenance_mode")? != 0,
            maintenance_reason: row.get("maintenance_reason")?,
            maintenance_started_at: row.get("maintenance_started_at")?,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or_else(empty_json),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Branch {
    pub id: String,
    pub database_id: String,
    pub name: String,
    pub parent_branch: Option<String>,
    pub schema_version: Option<String>,
    pub materialized: bool,
    pub maintenance_mode: bool,
    pub maintenance_reason: Option<String>,
    pub maintenance_started_at: Option<String>,
    pub cdc_enabled: bool,
    pub archived_at: Option<String>,
    pub metadata: Json,
    pub created_at: String,
    pub updated_at: String,
}

impl Branch {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            database_id: row.get("database_id")?,
            name: row.get("name")?,
            parent_branch: row.get("parent_branch")?,
            schema_version: row.get("schema_version")?,
            materialized: row.get::<_, i64>("materialized")? != 0,
            maintenance_mode: row.get::<_, i64>("maintenance_mode")? != 0,
            maintenance_reason: row.get("maintenance_reason")?,
            maintenance_started_at: row.get("maintenance_started_at")?,
            cdc_enabled: row.get::<_, i64>("cdc_enabled")? != 0,
            archived_at: row.get("archived_at")?,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or_else(empty_json),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn is_main(&self) -> bool {
        self.name == "main"
    }
}

#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub branch_id: String,
    pub name: String,
    pub shard: String,
    pub materialized: bool,
    pub metadata: Json,
    pub created_at: String,
    pub updated_at: String,
}

impl Tenant {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get("metadata")?;
        Ok(Self {
            id: row.get("id")?,
            branch_id: row.get("branch_id")?,
            name: row.get("name")?,
            shard: row.get("shard")?,
            materialized: row.get::<_, i64>("materialized")? != 0,
            metadata: metadata
                .and_then(|m| serde_json::from_str(&m).ok())
                .unwrap_or_else(empty_json),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn is_main(&self) -> bool {
        self.name == crate::util::path::MAIN_TENANT
    }

    pub fn is_empty_template(&self) -> bool {
        self.name == crate::util::path::EMPTY_TENANT
    }
}

/// The fixed set of DDL operations CinchDB tracks. Only schema changes are
/// ever represented as a `Change`; DML never is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    CreateTable,
    DropTable,
    RenameTable,
    AddColumn,
    DropColumn,
    RenameColumn,
    ModifyColumn,
    AlterColumnNullable,
    CreateView,
    DropView,
    UpdateView,
    CreateIndex,
    DropIndex,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::CreateTable => "create_table",
            ChangeType::DropTable => "drop_table",
            ChangeType::RenameTable => "rename_table",
            ChangeType::AddColumn => "add_column",
            ChangeType::DropColumn => "drop_column",
            ChangeType::RenameColumn => "rename_column",
            ChangeType::ModifyColumn => "modify_column",
            ChangeType::AlterColumnNullable => "alter_column_nullable",
            ChangeType::CreateView => "create_view",
            ChangeType::DropView => "drop_view",
            ChangeType::UpdateView => "update_view",
            ChangeType::CreateIndex => "create_index",
            ChangeType::DropIndex => "drop_index",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "create_table" => ChangeType::CreateTable,
            "drop_table" => ChangeType::DropTable,
            "rename_table" => ChangeType::RenameTable,
            "add_column" => ChangeType::AddColumn,
            "drop_column" => ChangeType::DropColumn,
            "rename_column" => ChangeType::RenameColumn,
            "modify_column" => ChangeType::ModifyColumn,
            "alter_column_nullable" => ChangeType::AlterColumnNullable,
            "create_view" => ChangeType::CreateView,
            "drop_view" => ChangeType::DropView,
            "update_view" => ChangeType::UpdateView,
            "create_index" => ChangeType::CreateIndex,
            "drop_index" => ChangeType::DropIndex,
            other => return Err(format!("invalid change type: {other}")),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Change {
    pub id: String,
    pub database_id: String,
    pub origin_branch_id: Option<String>,
    pub origin_branch_name: Option<String>,
    pub change_type: ChangeType,
    pub entity_type: String,
    pub entity_name: String,
    pub details: Json,
    pub sql: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Change {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get("type")?;
        let change_type = type_str.parse::<ChangeType>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let details: Option<String> = row.get("details")?;
        Ok(Self {
            id: row.get("id")?,
            database_id: row.get("database_id")?,
            origin_branch_id: row.get("origin_branch_id")?,
            origin_branch_name: row.get("origin_branch_name")?,
            change_type,
            entity_type: row.get("entity_type")?,
            entity_name: row.get("entity_name")?,
            details: details
                .and_then(|d| serde_json::from_str(&d).ok())
                .unwrap_or_else(empty_json),
            sql: row.get("sql")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// A change as linked into one branch's ordered history.
#[derive(Debug, Clone)]
pub struct BranchChange {
    pub branch_id: String,
    pub branch_name: String,
    pub change_id: String,
    pub applied: bool,
    pub applied_order: i64,
    pub copied_from_branch_id: Option<String>,
    pub copied_from_branch_name: Option<String>,
}

impl BranchChange {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            branch_id: row.get("branch_id")?,
            branch_name: row.get("branch_name")?,
            change_id: row.get("change_id")?,
            applied: row.get::<_, i64>("applied")? != 0,
            applied_order: row.get("applied_order")?,
            copied_from_branch_id: row.get("copied_from_branch_id")?,
            copied_from_branch_name: row.get("copied_from_branch_name")?,
        })
    }
}

/// A change joined with its branch-local applied state and ordering --
/// what [`crate::change_tracker::ChangeTracker`] hands back to callers.
#[derive(Debug, Clone)]
pub struct TrackedChange {
    pub change: Change,
    pub applied: bool,
    pub applied_order: i64,
}
