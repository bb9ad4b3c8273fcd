// src/merge.rs

//! Merges one branch's changes into another. A merge is fast-forward when
//! the target's history is already a prefix of the source's; otherwise it
//! is a three-way merge that replays the source's divergent changes onto
//! the target, refusing if any of them conflict.
//!
//! `main` is privileged: [`MergeEngine::merge_branches`] refuses any merge
//! that targets it, and [`MergeEngine::merge_into_main`] is the only path
//! that may write to it, gated on the source already having incorporated
//! every change currently on `main`.

use crate::change_applier::ChangeApplier;
use crate::change_tracker::ChangeTracker;
use crate::comparator::ChangeComparator;
use crate::error::{Error, Result};
use crate::metadata::models::{Branch, Change};
use crate::metadata::MetadataStore;
use std::sync::Arc;
use tracing::info;

pub struct MergePreview {
    pub fast_forward: bool,
    pub changes_to_apply: Vec<Change>,
    pub conflicts: Vec<(Change, Change)>,
}

impl MergePreview {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Result of [`MergeEngine::can_merge`]: whether a merge is currently
/// possible, why not if it isn't, and enough counts to preview its size
/// without actually running it.
#[derive(Debug, Clone)]
pub struct MergeCheck {
    pub can_merge: bool,
    pub reason: Option<String>,
    pub merge_type: Option<MergeType>,
    pub conflicts: Vec<String>,
    pub changes_to_merge: usize,
    pub target_changes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    FastForward,
    ThreeWay,
}

/// One statement a [`MergeEngine::merge_branches`] dry run would have run,
/// annotated with the change it came from.
#[derive(Debug, Clone)]
pub struct MergeStep {
    pub change_id: String,
    pub change_type: String,
    pub entity_type: String,
    pub entity_name: String,
    pub label: String,
    pub sql: Option<String>,
}

/// Outcome of a real or dry-run merge. `applied` counts changes actually
/// written to the target; during a dry run it is always 0 and `steps`
/// holds what would have run instead.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub dry_run: bool,
    pub applied: usize,
    pub steps: Vec<MergeStep>,
}

pub struct MergeEngine {
    metadata: Arc<MetadataStore>,
    tracker: ChangeTracker,
    applier: ChangeApplier,
}

impl MergeEngine {
    pub fn new(metadata: Arc<MetadataStore>, tracker: ChangeTracker, applier: ChangeApplier) -> Self {
        Self {
            metadata,
            tracker,
            applier,
        }
    }

    fn comparator(&self) -> ChangeComparator<'_> {
        ChangeComparator::new(&self.metadata)
    }

    pub fn can_merge(&self, source: &Branch, target: &Branch) -> Result<MergeCheck> {
        let comparator = self.comparator();
        let fast_forward = comparator.can_fast_forward_merge(&source.id, &target.id)?;
        let conflicts = comparator.detect_conflicts(&source.id, &target.id)?;
        let changes_to_merge = comparator.get_merge_order(&source.id, &target.id)?.len();
        let target_changes = comparator.get_divergent_changes(&target.id, &source.id)?.len();

        let conflict_labels: Vec<String> = conflicts
            .iter()
            .map(|(s, t)| format!("{}:{} (source {} vs target {})", s.entity_type, s.entity_name, s.id, t.id))
            .collect();

        if target.is_main() {
            return Ok(MergeCheck {
                can_merge: false,
                reason: Some("merging into 'main' requires merge_into_main".to_string()),
                merge_type: None,
                conflicts: conflict_labels,
                changes_to_merge,
                target_changes,
            });
        }

        let (can_merge, reason) = if !conflict_labels.is_empty() {
            (false, Some(format!("{} conflicting change(s) between the two branches", conflict_labels.len())))
        } else {
            (true, None)
        };

        Ok(MergeCheck {
            can_merge,
            reason,
            merge_type: Some(if fast_forward { MergeType::FastForward } else { MergeType::ThreeWay }),
            conflicts: conflict_labels,
            changes_to_merge,
            target_changes,
        })
    }

    pub fn get_merge_preview(&self, source: &Branch, target: &Branch) -> Result<MergePreview> {
        let comparator = self.comparator();
        let fast_forward = comparator.can_fast_forward_merge(&source.id, &target.id)?;
        let changes_to_apply = comparator.get_merge_order(&source.id, &target.id)?;
        let conflicts = comparator.detect_conflicts(&source.id, &target.id)?;
        Ok(MergePreview {
            fast_forward,
            changes_to_apply,
            conflicts,
        })
    }

    /// Merge `source` into `target`. `target` must not be `main`; use
    /// [`Self::merge_into_main`] for that. `force` proceeds despite
    /// detected conflicts (the target's conflicting changes are kept;
    /// the source's conflicting changes are still linked but left
    /// unapplied for a human to reconcile). `dry_run` computes and
    /// returns the statements a real merge would run without touching
    /// any tenant or the catalog.
    pub fn merge_branches(&self, source: &Branch, target: &Branch, force: bool, dry_run: bool) -> Result<MergeOutcome> {
        if target.is_main() {
            return Err(Error::MergeError {
                reason: "merging into 'main' requires merge_into_main".to_string(),
                conflicts: Vec::new(),
            });
        }
        self.merge_locked(source, target, force, dry_run)
    }

    /// Merge `source` into `main`. Refuses unless `source` already contains
    /// every change currently on `main` -- i.e. `main` is a fast-forward
    /// ancestor of `source` -- so a stale branch can't silently overwrite
    /// changes merged into `main` after it branched.
    pub fn merge_into_main(&self, source: &Branch, main: &Branch, force: bool, dry_run: bool) -> Result<MergeOutcome> {
        if !main.is_main() {
            return Err(Error::MergeError {
                reason: "target branch is not 'main'".to_string(),
                conflicts: Vec::new(),
            });
        }
        if !self.comparator().can_fast_forward_merge(&source.id, &main.id)? {
            return Err(Error::MergeError {
                reason: format!(
                    "branch '{}' is not up to date with 'main'; merge main into it first",
                    source.name
                ),
                conflicts: Vec::new(),
            });
        }
        self.merge_locked(source, main, force, dry_run)
    }

    fn merge_locked(&self, source: &Branch, target: &Branch, force: bool, dry_run: bool) -> Result<MergeOutcome> {
        let preview = self.get_merge_preview(source, target)?;
        if !preview.is_clean() && !force {
            return Err(Error::MergeError {
                reason: format!("{} conflicting change(s) between the two branches", preview.conflicts.len()),
                conflicts: preview
                    .conflicts
                    .iter()
                    .map(|(s, t)| format!("{}:{} (source {} vs target {})", s.entity_type, s.entity_name, s.id, t.id))
                    .collect(),
            });
        }

        let conflicting_ids: std::collections::HashSet<String> =
            preview.conflicts.iter().map(|(s, _)| s.id.clone()).collect();

        if preview.changes_to_apply.is_empty() {
            return Ok(MergeOutcome {
                dry_run,
                applied: 0,
                steps: Vec::new(),
            });
        }

        if dry_run {
            let steps = preview
                .changes_to_apply
                .iter()
                .filter(|c| !conflicting_ids.contains(&c.id))
                .map(|change| MergeStep {
                    change_id: change.id.clone(),
                    change_type: change.change_type.as_str().to_string(),
                    entity_type: change.entity_type.clone(),
                    entity_name: change.entity_name.clone(),
                    label: format!("apply {} {} '{}'", change.change_type.as_str(), change.entity_type, change.entity_name),
                    sql: change.sql.clone(),
                })
                .collect();
            return Ok(MergeOutcome {
                dry_run: true,
                applied: 0,
                steps,
            });
        }

        let mut applied = 0;
        for change in &preview.changes_to_apply {
            if conflicting_ids.contains(&change.id) {
                continue;
            }
            let tracked = self
                .metadata
                .get_branch_change_link(&source.id, &change.id)?
                .ok_or_else(|| Error::CatalogError("merge change missing its source link".to_string()))?;

            self.metadata.link_change_to_branch(
                &target.id,
                &target.name,
                &change.id,
                false,
                Some((source.id.as_str(), source.name.as_str())),
            )?;

            if tracked.applied {
                self.applier.apply_change(target, change)?;
                applied += 1;
            }
        }

        info!(source = source.name, target = target.name, count = applied, "merged branch");
        Ok(MergeOutcome {
            dry_run: false,
            applied,
            steps: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchManager;
    use crate::metadata::models::ChangeType;
    use crate::tenant::TenantManager;
    use serde_json::Value as Json;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<MetadataStore>, Branch, Branch, String) {
        std::env::set_var("CINCHDB_SKIP_MAINTENANCE_DELAY", "1");
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let main = metadata.create_branch(&db.id, "main", None).unwrap();

        let tenants = TenantManager::new(metadata.clone(), dir.path(), "app");
        tenants.ensure_empty_tenant(&main).unwrap();
        let main_tenant = tenants.create_tenant(&main, "main", true).unwrap();
        tenants.materialize_tenant(&main, &main_tenant).unwrap();

        let tracker = ChangeTracker::new(metadata.clone());
        let bm = BranchManager::new(metadata.clone(), tracker, tenants, dir.path(), "app");
        let feature = bm.create_branch(&db.id, "feature", None).unwrap();

        (dir, metadata, main, feature, db.id)
    }

    fn engine(metadata: Arc<MetadataStore>, project_root: &std::path::Path, database: &str) -> MergeEngine {
        let tracker = ChangeTracker::new(metadata.clone());
        let tenants = TenantManager::new(metadata.clone(), project_root, database);
        let applier = ChangeApplier::new(metadata.clone(), ChangeTracker::new(metadata.clone()), tenants, project_root, database);
        MergeEngine::new(metadata, tracker, applier)
    }

    #[test]
    fn clean_fast_forward_merge_applies_changes() {
        let (dir, metadata, main, feature, db_id) = setup();
        let tracker = ChangeTracker::new(metadata.clone());

        let change = tracker
            .add_change(&db_id, &feature.id, &feature.name, ChangeType::CreateTable, "table", "widgets", &Json::Object(Default::default()), Some("CREATE TABLE widgets (id TEXT PRIMARY KEY)"))
            .unwrap();
        tracker.mark_applied(&feature.id, &change.id).unwrap();

        let merge_engine = engine(metadata.clone(), dir.path(), "app");
        let outcome = merge_engine.merge_into_main(&feature, &main, false, false).unwrap();
        assert_eq!(outcome.applied, 1);

        let main_path = crate::util::path::tenant_db_path(dir.path(), "app", "main", "main").unwrap();
        let conn = crate::connection::open_existing(&main_path, &crate::connection::EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'widgets'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn merge_branches_rejects_main_as_target() {
        let (dir, metadata, main, feature, _db_id) = setup();
        let merge_engine = engine(metadata, dir.path(), "app");
        let result = merge_engine.merge_branches(&feature, &main, false, false);
        assert!(matches!(result, Err(Error::MergeError { .. })));
    }

    #[test]
    fn dry_run_merge_lists_steps_without_applying() {
        let (dir, metadata, main, feature, db_id) = setup();
        let tracker = ChangeTracker::new(metadata.clone());
        let change = tracker
            .add_change(&db_id, &feature.id, &feature.name, ChangeType::CreateTable, "table", "widgets", &Json::Object(Default::default()), Some("CREATE TABLE widgets (id TEXT PRIMARY KEY)"))
            .unwrap();
        tracker.mark_applied(&feature.id, &change.id).unwrap();

        let merge_engine = engine(metadata.clone(), dir.path(), "app");
        let outcome = merge_engine.merge_into_main(&feature, &main, false, true).unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].sql.as_deref().unwrap().contains("CREATE TABLE widgets"));

        let main_path = crate::util::path::tenant_db_path(dir.path(), "app", "main", "main").unwrap();
        let conn = crate::connection::open_existing(&main_path, &crate::connection::EncryptionConfig::disabled()).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE name = 'widgets'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0, "dry run must not touch the target tenant");
    }

    #[test]
    fn merge_into_main_rejects_stale_source() {
        let (dir, metadata, main, feature, db_id) = setup();
        let tracker = ChangeTracker::new(metadata.clone());

        let main_change = tracker
            .add_change(&db_id, &main.id, &main.name, ChangeType::CreateTable, "table", "only_on_main", &Json::Object(Default::default()), Some("CREATE TABLE only_on_main (id TEXT)"))
            .unwrap();
        tracker.mark_applied(&main.id, &main_change.id).unwrap();

        let merge_engine = engine(metadata, dir.path(), "app");
        let result = merge_engine.merge_into_main(&feature, &main, false, false);
        assert!(matches!(result, Err(Error::MergeError { .. })));
    }
}
