// src/error.rs

use thiserror::Error;

/// Core error types for CinchDB
#[derive(Error, Debug)]
pub enum Error {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors for `details`/`metadata` columns
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A supplied identifier fails validation
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// Catalog uniqueness violation
    #[error("{entity} '{name}' already exists")]
    AlreadyExists { entity: String, name: String },

    /// Lookup miss
    #[error("{entity} '{name}' not found")]
    NotFound { entity: String, name: String },

    /// Attempted mutation of a protected entity (main, __empty__, id/created_at/updated_at, __/sqlite_ prefixes)
    #[error("Protected entity: {0}")]
    ProtectedEntity(String),

    /// Write blocked because the branch (or database) is paused for a schema change
    #[error("Branch '{branch}' is in maintenance mode: {reason}")]
    MaintenanceMode { branch: String, reason: String },

    /// A DDL application failed and was rolled back
    #[error("Change '{change_id}' failed on tenant '{tenant}': {cause}")]
    ChangeError {
        change_id: String,
        tenant: String,
        cause: String,
    },

    /// Merge refused or aborted
    #[error("Merge error: {reason}")]
    MergeError {
        reason: String,
        conflicts: Vec<String>,
    },

    /// I/O or SQL failure against metadata.db, surfaced with extra context
    #[error("Catalog error: {0}")]
    CatalogError(String),

    /// Encryption enabled but no key supplied at open time
    #[error("Encryption is enabled but no key was provided")]
    EncryptionKeyMissing,

    /// A foreign key referenced a table/column that does not exist
    #[error("Foreign key references non-existent {table}.{column}")]
    ForeignKeyInvalid { table: String, column: String },

    /// Project root (.cinchdb/) could not be located
    #[error("No CinchDB project found starting from '{0}'")]
    ProjectNotFound(String),
}

/// Result type alias using CinchDB's Error type
pub type Result<T> = std::result::Result<T, Error>;
