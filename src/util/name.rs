// src/util/name.rs

//! Name validation for CinchDB entities
//!
//! Enforces the naming rules shared by databases, branches, tenants,
//! tables, and columns: lowercase ASCII, bounded length, no path
//! traversal or control characters, and no reserved Windows device names.

use crate::error::{Error, Result};

/// Reserved device names a caller cannot use, regardless of entity type.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Which naming rules apply to a given identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    /// Database, branch, or tenant names: may start with a digit, hyphens allowed.
    Entity,
    /// Table/column names: must start with a letter, no hyphens.
    SqlIdentifier,
}

impl NameKind {
    fn label(self, entity_type: &str) -> String {
        entity_type.to_string()
    }
}

/// Validate that `name` meets CinchDB's naming requirements for `entity_type`.
///
/// `entity_type` is used only to build error messages (e.g. "database",
/// "branch", "tenant", "table", "column") and to select which pattern
/// applies: `table`/`column` use [`NameKind::SqlIdentifier`], everything
/// else uses [`NameKind::Entity`].
pub fn validate_name(name: &str, entity_type: &str) -> Result<()> {
    let kind = if entity_type == "table" || entity_type == "column" {
        NameKind::SqlIdentifier
    } else {
        NameKind::Entity
    };
    validate_name_kind(name, entity_type, kind)
}

fn invalid(entity_type: &str, reason: impl std::fmt::Display) -> Error {
    Error::InvalidName(format!("{entity_type} name {reason}"))
}

fn validate_name_kind(name: &str, entity_type: &str, kind: NameKind) -> Result<()> {
    let _ = NameKind::label(kind, entity_type);

    if name.is_empty() {
        return Err(invalid(entity_type, "cannot be empty"));
    }

    if name.chars().count() > 63 {
        return Err(invalid(entity_type, "cannot exceed 63 characters"));
    }

    // Path traversal / filesystem-unsafe sequences, checked before anything else.
    if name.contains("..") || name.contains('/') || name.contains('\\') || name.contains('~') {
        return Err(invalid(
            entity_type,
            format!("'{name}' contains forbidden path traversal characters"),
        ));
    }

    if name.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(invalid(
            entity_type,
            "contains invalid control characters or null bytes",
        ));
    }

    if name.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(invalid(
            entity_type,
            format!("'{name}' must be lowercase; use '{}'", name.to_lowercase()),
        ));
    }

    match kind {
        NameKind::Entity => validate_entity_pattern(name, entity_type)?,
        NameKind::SqlIdentifier => validate_sql_identifier_pattern(name, entity_type)?,
    }

    if has_consecutive_specials(name) {
        return Err(invalid(
            entity_type,
            format!("'{name}' cannot contain consecutive special characters"),
        ));
    }

    if RESERVED_NAMES.contains(&name) {
        return Err(invalid(
            entity_type,
            format!("'{name}' is a reserved name"),
        ));
    }

    Ok(())
}

fn validate_entity_pattern(name: &str, entity_type: &str) -> Result<()> {
    let is_valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_';
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();

    let ok = (first.is_ascii_lowercase() || first.is_ascii_digit())
        && (last.is_ascii_lowercase() || last.is_ascii_digit())
        && name.chars().all(is_valid_char);

    if !ok {
        return Err(invalid(
            entity_type,
            format!(
                "'{name}' must contain only lowercase letters, digits, '-' and '_', \
                 and start/end with a letter or digit"
            ),
        ));
    }
    Ok(())
}

fn validate_sql_identifier_pattern(name: &str, entity_type: &str) -> Result<()> {
    let is_valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_';
    let first = name.chars().next().unwrap();
    let last = name.chars().last().unwrap();

    let ok = first.is_ascii_lowercase()
        && (last.is_ascii_lowercase() || last.is_ascii_digit())
        && name.chars().all(is_valid_char);

    if !ok {
        return Err(invalid(
            entity_type,
            format!(
                "'{name}' must start with a letter, contain only lowercase letters, \
                 digits and '_', and end with a letter or digit"
            ),
        ));
    }
    Ok(())
}

fn has_consecutive_specials(name: &str) -> bool {
    name.contains("--") || name.contains("__") || name.contains("-_") || name.contains("_-")
}

/// Non-throwing form of [`validate_name`], for prevalidation in callers
/// that don't want to handle the error path (e.g. UI-level input checks).
pub fn is_valid_name(name: &str, entity_type: &str) -> bool {
    validate_name(name, entity_type).is_ok()
}
