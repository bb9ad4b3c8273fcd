// src/data.rs

//! Parameterized CRUD against a single tenant. Schema changes are never
//! tracked here -- only row-level reads and writes -- so this manager
//! never touches [`crate::change_tracker::ChangeTracker`]. Every write
//! first materializes a lazy tenant and checks the branch isn't paused
//! for a schema change.

use crate::connection::{self, EncryptionConfig};
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Tenant};
use crate::metadata::MetadataStore;
use crate::tenant::TenantManager;
use crate::util::path;
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::ToSql;
use serde_json::{Map, Value as Json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// The comparison an individual [`Predicate`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

impl Operator {
    fn sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::In => "IN",
        }
    }
}

/// One filter clause: `column <op> value`. `In` expects `value` to be a
/// JSON array.
#[derive(Debug, Clone)]
pub struct Predicate {
    pub column: String,
    pub op: Operator,
    pub value: Json,
}

impl Predicate {
    pub fn new(column: impl Into<String>, op: Operator, value: Json) -> Self {
        Self {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Json) -> Self {
        Self::new(column, Operator::Eq, value)
    }
}

/// How multiple [`Predicate`]s in one call combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    fn sql(self) -> &'static str {
        match self {
            Logic::And => "AND",
            Logic::Or => "OR",
        }
    }
}

struct JsonParam(Json);

impl ToSql for JsonParam {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match &self.0 {
            Json::Null => SqlValue::Null,
            Json::Bool(b) => SqlValue::Integer(*b as i64),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or_default())
                }
            }
            Json::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

/// Render `predicates` (combined with `logic`) into a `WHERE` clause plus
/// its bound parameters, or `None` if there are no predicates.
fn compile_where(predicates: &[Predicate], logic: Logic) -> Result<Option<(String, Vec<JsonParam>)>> {
    if predicates.is_empty() {
        return Ok(None);
    }
    let mut clauses = Vec::new();
    let mut params: Vec<JsonParam> = Vec::new();

    for p in predicates {
        match p.op {
            Operator::In => {
                let items = p.value.as_array().ok_or_else(|| {
                    Error::InvalidName(format!("predicate on '{}' uses In but value is not an array", p.column))
                })?;
                if items.is_empty() {
                    clauses.push("0".to_string());
                    continue;
                }
                let placeholders = vec!["?"; items.len()].join(", ");
                clauses.push(format!("{} IN ({placeholders})", p.column));
                params.extend(items.iter().cloned().map(JsonParam));
            }
            _ => {
                clauses.push(format!("{} {} ?", p.column, p.op.sql()));
                params.push(JsonParam(p.value.clone()));
            }
        }
    }

    let joiner = format!(" {} ", logic.sql());
    Ok(Some((clauses.join(&joiner), params)))
}

pub struct DataManager {
    metadata: Arc<MetadataStore>,
    tenants: TenantManager,
    project_root: PathBuf,
    database: String,
}

impl DataManager {
    pub fn new(metadata: Arc<MetadataStore>, tenants: TenantManager, project_root: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            metadata,
            tenants,
            project_root: project_root.into(),
            database: database.into(),
        }
    }

    fn check_maintenance_mode(&self, branch: &Branch) -> Result<()> {
        if self.metadata.is_branch_in_maintenance(&branch.id)? {
            return Err(Error::MaintenanceMode {
                branch: branch.name.clone(),
                reason: "a schema change is being applied".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_tenant_materialized(&self, branch: &Branch, tenant: &Tenant) -> Result<rusqlite::Connection> {
        self.check_maintenance_mode(branch)?;
        let db_path = self.tenants.materialize_tenant(branch, tenant)?;
        connection::open_existing(&db_path, &EncryptionConfig::disabled())
    }

    /// Read-only connection: a lazy tenant reads through the branch's
    /// `__empty__` template rather than materializing.
    fn read_conn(&self, branch: &Branch, tenant: &Tenant) -> Result<rusqlite::Connection> {
        let db_path = if tenant.materialized {
            path::tenant_db_path(&self.project_root, &self.database, &branch.name, &tenant.name)?
        } else {
            path::tenant_db_path(&self.project_root, &self.database, &branch.name, path::EMPTY_TENANT)?
        };
        connection::open_existing(&db_path, &EncryptionConfig::disabled())
    }

    fn row_to_json(stmt_columns: &[String], row: &rusqlite::Row) -> rusqlite::Result<Json> {
        let mut map = Map::new();
        for (i, name) in stmt_columns.iter().enumerate() {
            let value: Json = match row.get_ref(i)? {
                rusqlite::types::ValueRef::Null => Json::Null,
                rusqlite::types::ValueRef::Integer(v) => Json::from(v),
                rusqlite::types::ValueRef::Real(v) => serde_json::Number::from_f64(v).map(Json::Number).unwrap_or(Json::Null),
                rusqlite::types::ValueRef::Text(t) => Json::String(String::from_utf8_lossy(t).into_owned()),
                rusqlite::types::ValueRef::Blob(_) => Json::Null,
            };
            map.insert(name.clone(), value);
        }
        Ok(Json::Object(map))
    }

    /// Insert one row, auto-generating `id` and stamping `created_at`/
    /// `updated_at`. Returns the full row as stored.
    pub fn create_from_dict(&self, branch: &Branch, tenant: &Tenant, table: &str, data: &Map<String, Json>) -> Result<Json> {
        let conn = self.ensure_tenant_materialized(branch, tenant)?;
        let id = uuid::Uuid::new_v4().to_string();
        let ts = chrono::Utc::now().to_rfc3339();

        let mut columns = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string()];
        let mut params: Vec<JsonParam> = vec![
            JsonParam(Json::String(id.clone())),
            JsonParam(Json::String(ts.clone())),
            JsonParam(Json::String(ts.clone())),
        ];
        for (k, v) in data {
            columns.push(k.clone());
            params.push(JsonParam(v.clone()));
        }
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!("INSERT INTO {table} ({}) VALUES ({placeholders})", columns.join(", "));
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        conn.execute(&sql, refs.as_slice())?;
        debug!(table, id, "inserted row");

        self.find_by_id_conn(&conn, table, &id)?.ok_or_else(|| Error::CatalogError("row vanished after insert".to_string()))
    }

    /// Insert every row of `rows` inside one transaction; any failure
    /// (most commonly a `UNIQUE` violation) rolls all of them back.
    pub fn bulk_create_from_dict(&self, branch: &Branch, tenant: &Tenant, table: &str, rows: &[Map<String, Json>]) -> Result<usize> {
        let mut conn = self.ensure_tenant_materialized(branch, tenant)?;
        let tx = conn.transaction()?;
        let ts = chrono::Utc::now().to_rfc3339();

        for data in rows {
            let id = uuid::Uuid::new_v4().to_string();
            let mut columns = vec!["id".to_string(), "created_at".to_string(), "updated_at".to_string()];
            let mut params: Vec<JsonParam> = vec![
                JsonParam(Json::String(id)),
                JsonParam(Json::String(ts.clone())),
                JsonParam(Json::String(ts.clone())),
            ];
            for (k, v) in data {
                columns.push(k.clone());
                params.push(JsonParam(v.clone()));
            }
            let placeholders = vec!["?"; columns.len()].join(", ");
            let sql = format!("INSERT INTO {table} ({}) VALUES ({placeholders})", columns.join(", "));
            let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            tx.execute(&sql, refs.as_slice())?;
        }
        let count = rows.len();
        tx.commit()?;
        debug!(table, count, "bulk inserted rows");
        Ok(count)
    }

    fn find_by_id_conn(&self, conn: &rusqlite::Connection, table: &str, id: &str) -> Result<Option<Json>> {
        let sql = format!("SELECT * FROM {table} WHERE id = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let row = stmt
            .query_row([id], |row| Self::row_to_json(&columns, row))
            .map(Some)
            .or_else(|e| if matches!(e, rusqlite::Error::QueryReturnedNoRows) { Ok(None) } else { Err(e) })?;
        Ok(row)
    }

    pub fn find_by_id(&self, branch: &Branch, tenant: &Tenant, table: &str, id: &str) -> Result<Option<Json>> {
        let conn = self.read_conn(branch, tenant)?;
        self.find_by_id_conn(&conn, table, id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn select(
        &self,
        branch: &Branch,
        tenant: &Tenant,
        table: &str,
        predicates: &[Predicate],
        logic: Logic,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Json>> {
        let conn = self.read_conn(branch, tenant)?;
        let mut sql = format!("SELECT * FROM {table}");
        let where_clause = compile_where(predicates, logic)?;
        if let Some((clause, _)) = &where_clause {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let params: Vec<&dyn ToSql> = where_clause.as_ref().map(|(_, p)| p.iter().map(|v| v as &dyn ToSql).collect()).unwrap_or_default();
        let rows = stmt
            .query_map(params.as_slice(), |row| Self::row_to_json(&columns, row))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self, branch: &Branch, tenant: &Tenant, table: &str, predicates: &[Predicate], logic: Logic) -> Result<i64> {
        let conn = self.read_conn(branch, tenant)?;
        let mut sql = format!("SELECT COUNT(*) FROM {table}");
        let where_clause = compile_where(predicates, logic)?;
        if let Some((clause, _)) = &where_clause {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        let params: Vec<&dyn ToSql> = where_clause.as_ref().map(|(_, p)| p.iter().map(|v| v as &dyn ToSql).collect()).unwrap_or_default();
        let count: i64 = conn.query_row(&sql, params.as_slice(), |row| row.get(0))?;
        Ok(count)
    }

    pub fn update_by_id(&self, branch: &Branch, tenant: &Tenant, table: &str, id: &str, updates: &Map<String, Json>) -> Result<()> {
        let conn = self.ensure_tenant_materialized(branch, tenant)?;
        let ts = chrono::Utc::now().to_rfc3339();

        let mut set_clauses = vec!["updated_at = ?".to_string()];
        let mut params: Vec<JsonParam> = vec![JsonParam(Json::String(ts))];
        for (k, v) in updates {
            set_clauses.push(format!("{k} = ?"));
            params.push(JsonParam(v.clone()));
        }
        params.push(JsonParam(Json::String(id.to_string())));

        let sql = format!("UPDATE {table} SET {} WHERE id = ?", set_clauses.join(", "));
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        let changed = conn.execute(&sql, refs.as_slice())?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "row".to_string(),
                name: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn update_where(
        &self,
        branch: &Branch,
        tenant: &Tenant,
        table: &str,
        predicates: &[Predicate],
        logic: Logic,
        updates: &Map<String, Json>,
    ) -> Result<usize> {
        let conn = self.ensure_tenant_materialized(branch, tenant)?;
        let ts = chrono::Utc::now().to_rfc3339();

        let mut set_clauses = vec!["updated_at = ?".to_string()];
        let mut params: Vec<JsonParam> = vec![JsonParam(Json::String(ts))];
        for (k, v) in updates {
            set_clauses.push(format!("{k} = ?"));
            params.push(JsonParam(v.clone()));
        }

        let mut sql = format!("UPDATE {table} SET {}", set_clauses.join(", "));
        if let Some((clause, where_params)) = compile_where(predicates, logic)? {
            sql.push_str(&format!(" WHERE {clause}"));
            params.extend(where_params);
        }
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        Ok(conn.execute(&sql, refs.as_slice())?)
    }

    pub fn delete_by_id(&self, branch: &Branch, tenant: &Tenant, table: &str, id: &str) -> Result<()> {
        let conn = self.ensure_tenant_materialized(branch, tenant)?;
        let changed = conn.execute(&format!("DELETE FROM {table} WHERE id = ?1"), [id])?;
        if changed == 0 {
            return Err(Error::NotFound {
                entity: "row".to_string(),
                name: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_where(&self, branch: &Branch, tenant: &Tenant, table: &str, predicates: &[Predicate], logic: Logic) -> Result<usize> {
        let conn = self.ensure_tenant_materialized(branch, tenant)?;
        let mut sql = format!("DELETE FROM {table}");
        let params = if let Some((clause, where_params)) = compile_where(predicates, logic)? {
            sql.push_str(&format!(" WHERE {clause}"));
            where_params
        } else {
            Vec::new()
        };
        let refs: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
        Ok(conn.execute(&sql, refs.as_slice())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema_objects::table::TableManager;
    use crate::schema_objects::ColumnDef;
    use crate::change_applier::ChangeApplier;
    use crate::change_tracker::ChangeTracker;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, TableManager, DataManager, Branch, Tenant) {
        std::env::set_var("CINCHDB_SKIP_MAINTENANCE_DELAY", "1");
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let branch = metadata.create_branch(&db.id, "main", None).unwrap();

        let tenants = TenantManager::new(metadata.clone(), dir.path(), "app");
        tenants.ensure_empty_tenant(&branch).unwrap();
        let tenant = tenants.create_tenant(&branch, "acme", true).unwrap();

        let applier = Arc::new(ChangeApplier::new(
            metadata.clone(),
            ChangeTracker::new(metadata.clone()),
            TenantManager::new(metadata.clone(), dir.path(), "app"),
            dir.path(),
            "app",
        ));
        let table_manager = TableManager::new(metadata.clone(), applier, dir.path(), "app");
        table_manager
            .create_table(
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

        let data_manager = DataManager::new(metadata, tenants, dir.path(), "app");
        (dir, table_manager, data_manager, branch, tenant)
    }

    #[test]
    fn create_materializes_lazy_tenant() {
        let (_dir, _tm, dm, branch, tenant) = setup();
        assert!(dm.tenants.is_tenant_lazy(&branch, &tenant.name).unwrap());

        let mut data = Map::new();
        data.insert("label".to_string(), Json::String("widget-a".to_string()));
        let row = dm.create_from_dict(&branch, &tenant, "widgets", &data).unwrap();

        assert_eq!(row.get("label").unwrap(), &Json::String("widget-a".to_string()));
        assert!(!dm.tenants.is_tenant_lazy(&branch, &tenant.name).unwrap());
    }

    #[test]
    fn select_with_eq_predicate_filters_rows() {
        let (_dir, _tm, dm, branch, tenant) = setup();
        for label in ["a", "b", "a"] {
            let mut data = Map::new();
            data.insert("label".to_string(), Json::String(label.to_string()));
            dm.create_from_dict(&branch, &tenant, "widgets", &data).unwrap();
        }

        let rows = dm
            .select(&branch, &tenant, "widgets", &[Predicate::eq("label", Json::String("a".to_string()))], Logic::And, None, None)
            .unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn bulk_create_rolls_back_on_unique_violation() {
        let (_dir, tm, dm, branch, tenant) = setup();
        tm.drop_table(&branch, "widgets").unwrap();
        tm.create_table(
            &branch,
            "widgets",
            &[ColumnDef {
                name: "label".to_string(),
                sql_type: "TEXT".to_string(),
                nullable: true,
                unique: true,
                default: None,
                foreign_key: None,
            }],
        )
        .unwrap();

        let mut a = Map::new();
        a.insert("label".to_string(), Json::String("dup".to_string()));
        let mut b = Map::new();
        b.insert("label".to_string(), Json::String("dup".to_string()));

        let result = dm.bulk_create_from_dict(&branch, &tenant, "widgets", &[a, b]);
        assert!(result.is_err());

        let count = dm.count(&branch, &tenant, "widgets", &[], Logic::And).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn write_fails_fast_during_maintenance_mode() {
        let (_dir, _tm, dm, branch, tenant) = setup();
        dm.metadata.set_branch_maintenance(&branch.id, true, Some("testing")).unwrap();

        let mut data = Map::new();
        data.insert("label".to_string(), Json::String("x".to_string()));
        let result = dm.create_from_dict(&branch, &tenant, "widgets", &data);
        assert!(matches!(result, Err(Error::MaintenanceMode { .. })));
    }

    #[test]
    fn delete_by_id_removes_row() {
        let (_dir, _tm, dm, branch, tenant) = setup();
        let mut data = Map::new();
        data.insert("label".to_string(), Json::String("x".to_string()));
        let row = dm.create_from_dict(&branch, &tenant, "widgets", &data).unwrap();
        let id = row.get("id").unwrap().as_str().unwrap().to_string();

        dm.delete_by_id(&branch, &tenant, "widgets", &id).unwrap();
        assert!(dm.find_by_id(&branch, &tenant, "widgets", &id).unwrap().is_none());
    }
}
