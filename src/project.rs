// src/project.rs

//! Project resolution and the active database/branch/tenant selection.
//!
//! A CinchDB project is any directory containing a `.cinchdb` directory.
//! [`Project::find`] walks upward from a starting path to locate it (the
//! way a `.git` checkout is located), the same search
//! [`crate::util::path::find_project_root`] performs for every other path
//! helper in the crate. The project also carries the "active" selection a
//! caller hasn't been explicit about -- which database, branch and tenant
//! to act on -- persisted in `.cinchdb/config.json` so the CLI can default
//! to it across invocations.

use crate::connection::EncryptionConfig;
use crate::error::{Error, Result};
use crate::util::path::{cinchdb_root, find_project_root, metadata_db_path};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.json";

fn default_name() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectConfig {
    #[serde(default = "default_name")]
    active_database: String,
    #[serde(default = "default_name")]
    active_branch: String,
    #[serde(default = "default_name")]
    active_tenant: String,
    #[serde(default)]
    encryption_key: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            active_database: default_name(),
            active_branch: default_name(),
            active_tenant: default_name(),
            encryption_key: None,
        }
    }
}

/// A resolved CinchDB project: its root directory plus the active
/// database/branch/tenant selection and optional encryption key.
#[derive(Debug, Clone)]
pub struct Project {
    pub root: PathBuf,
    pub database: String,
    pub branch: String,
    pub tenant: String,
    pub encryption: EncryptionConfig,
}

impl Project {
    /// Walk upward from `start` looking for `.cinchdb`, then load it.
    pub fn find(start: impl AsRef<Path>) -> Result<Self> {
        let start = start.as_ref();
        let root = find_project_root(start).ok_or_else(|| {
            Error::ProjectNotFound(format!(
                "no .cinchdb directory found above '{}'",
                start.display()
            ))
        })?;
        Self::load(root)
    }

    /// Load a project whose root is already known.
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = Self::read_config(&root)?;
        Ok(Self::from_config(root, config))
    }

    /// Create a new project at `root`, writing a fresh `.cinchdb/config.json`.
    /// Idempotent: calling it again on an already-initialized root just
    /// loads the existing config instead of overwriting it.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(cinchdb_root(&root))?;
        let config_path = Self::config_path(&root);
        let config = if config_path.exists() {
            Self::read_config(&root)?
        } else {
            let config = ProjectConfig::default();
            Self::write_config(&root, &config)?;
            config
        };
        Ok(Self::from_config(root, config))
    }

    fn from_config(root: PathBuf, config: ProjectConfig) -> Self {
        let encryption = match config.encryption_key {
            Some(key) => EncryptionConfig::with_key(key),
            None => EncryptionConfig::disabled(),
        };
        Self {
            root,
            database: config.active_database,
            branch: config.active_branch,
            tenant: config.active_tenant,
            encryption,
        }
    }

    fn config_path(root: &Path) -> PathBuf {
        cinchdb_root(root).join(CONFIG_FILE)
    }

    fn read_config(root: &Path) -> Result<ProjectConfig> {
        let path = Self::config_path(root);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ProjectConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_config(root: &Path, config: &ProjectConfig) -> Result<()> {
        let path = Self::config_path(root);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    fn to_config(&self) -> ProjectConfig {
        ProjectConfig {
            active_database: self.database.clone(),
            active_branch: self.branch.clone(),
            active_tenant: self.tenant.clone(),
            encryption_key: self.encryption.key.clone(),
        }
    }

    /// Update the active selection and persist it. Any argument left `None`
    /// keeps its current value.
    pub fn set_active(
        &mut self,
        database: Option<&str>,
        branch: Option<&str>,
        tenant: Option<&str>,
    ) -> Result<()> {
        if let Some(database) = database {
            self.database = database.to_string();
        }
        if let Some(branch) = branch {
            self.branch = branch.to_string();
        }
        if let Some(tenant) = tenant {
            self.tenant = tenant.to_string();
        }
        Self::write_config(&self.root, &self.to_config())
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        metadata_db_path(&self.root)
    }
}
