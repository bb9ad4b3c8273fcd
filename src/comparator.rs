// src/comparator.rs

//! Compares two branches' change histories to classify a prospective
//! merge and find the changes it would need to apply.
//!
//! A branch's history is the ordered sequence of `change_id`s from
//! `branch_changes`. Because every branch is created by copying its
//! parent's full history (see [`crate::branch::BranchManager::create_branch`]),
//! two related branches always share a common prefix of change ids; the
//! comparator's job is finding where that prefix ends.

use crate::error::Result;
use crate::metadata::models::{Change, TrackedChange};
use crate::metadata::MetadataStore;
use std::collections::HashSet;

pub struct ChangeComparator<'a> {
    metadata: &'a MetadataStore,
}

impl<'a> ChangeComparator<'a> {
    pub fn new(metadata: &'a MetadataStore) -> Self {
        Self { metadata }
    }

    /// Changes present in `source_branch_id`'s history but absent from
    /// `target_branch_id`'s, in source order.
    pub fn get_divergent_changes(&self, source_branch_id: &str, target_branch_id: &str) -> Result<Vec<TrackedChange>> {
        let source = self.metadata.get_branch_changes(source_branch_id)?;
        let target_ids: HashSet<String> = self
            .metadata
            .get_branch_changes(target_branch_id)?
            .into_iter()
            .map(|c| c.change.id)
            .collect();

        Ok(source
            .into_iter()
            .filter(|c| !target_ids.contains(&c.change.id))
            .collect())
    }

    /// The last change id shared by both histories, walking from the start
    /// of each. Returns `None` if the two histories share nothing (they
    /// were never related by a common branch point).
    pub fn find_common_ancestor(&self, branch_a_id: &str, branch_b_id: &str) -> Result<Option<String>> {
        let a = self.metadata.get_branch_changes(branch_a_id)?;
        let b = self.metadata.get_branch_changes(branch_b_id)?;

        let mut common = None;
        let len = a.len().min(b.len());
        for i in 0..len {
            if a[i].change.id == b[i].change.id {
                common = Some(a[i].change.id.clone());
            } else {
                break;
            }
        }
        Ok(common)
    }

    /// True when `target`'s full history is a prefix of `source`'s, i.e.
    /// merging would only ever add changes to `target`, never reconcile
    /// divergent ones.
    pub fn can_fast_forward_merge(&self, source_branch_id: &str, target_branch_id: &str) -> Result<bool> {
        let source = self.metadata.get_branch_changes(source_branch_id)?;
        let target = self.metadata.get_branch_changes(target_branch_id)?;

        if target.len() > source.len() {
            return Ok(false);
        }
        for (s, t) in source.iter().zip(target.iter()) {
            if s.change.id != t.change.id {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Changes on each side, after the common ancestor, that touch the same
    /// `(entity_type, entity_name)` pair -- the set a three-way merge
    /// cannot apply without human review.
    pub fn detect_conflicts(&self, source_branch_id: &str, target_branch_id: &str) -> Result<Vec<(Change, Change)>> {
        let common_ancestor = self.find_common_ancestor(source_branch_id, target_branch_id)?;

        let source_only = self.changes_after(source_branch_id, &common_ancestor)?;
        let target_only = self.changes_after(target_branch_id, &common_ancestor)?;

        let mut conflicts = Vec::new();
        for s in &source_only {
            for t in &target_only {
                if s.entity_type == t.entity_type && s.entity_name == t.entity_name {
                    conflicts.push((s.clone(), t.clone()));
                }
            }
        }
        Ok(conflicts)
    }

    fn changes_after(&self, branch_id: &str, ancestor_change_id: &Option<String>) -> Result<Vec<Change>> {
        let history = self.metadata.get_branch_changes(branch_id)?;
        let start = match ancestor_change_id {
            Some(id) => history.iter().position(|c| &c.change.id == id).map(|i| i + 1).unwrap_or(0),
            None => 0,
        };
        Ok(history[start..].iter().map(|c| c.change.clone()).collect())
    }

    /// The changes `source_branch_id` has beyond `target_branch_id`, in the
    /// order they must be (re-)applied during a merge.
    pub fn get_merge_order(&self, source_branch_id: &str, target_branch_id: &str) -> Result<Vec<Change>> {
        Ok(self
            .get_divergent_changes(source_branch_id, target_branch_id)?
            .into_iter()
            .map(|tc| tc.change)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::BranchManager;
    use crate::change_tracker::ChangeTracker;
    use crate::metadata::models::ChangeType;
    use crate::tenant::TenantManager;
    use serde_json::Value as Json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<MetadataStore>, String, String, String) {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".cinchdb")).unwrap();
        let metadata = Arc::new(MetadataStore::open(dir.path()).unwrap());
        let db = metadata.create_database("app", None).unwrap();
        let main = metadata.create_branch(&db.id, "main", None).unwrap();

        let tenants = TenantManager::new(metadata.clone(), dir.path(), "app");
        tenants.ensure_empty_tenant(&main).unwrap();

        let tracker = ChangeTracker::new(metadata.clone());
        let c1 = tracker
            .add_change(&db.id, &main.id, &main.name, ChangeType::CreateTable, "table", "t1", &Json::Object(Default::default()), None)
            .unwrap();
        tracker.mark_applied(&main.id, &c1.id).unwrap();

        let bm = BranchManager::new(metadata.clone(), tracker, tenants, dir.path(), "app");
        let feature = bm.create_branch(&db.id, "feature", None).unwrap();

        (dir, metadata, main.id, feature.id, db.id)
    }

    #[test]
    fn fresh_branch_is_fast_forward_identical() {
        let (_dir, metadata, main_id, feature_id, _db_id) = setup();
        let comparator = ChangeComparator::new(&metadata);

        assert!(comparator.can_fast_forward_merge(&main_id, &feature_id).unwrap());
        assert!(comparator.get_divergent_changes(&main_id, &feature_id).unwrap().is_empty());
    }

    #[test]
    fn new_change_on_source_is_fast_forwardable() {
        let (_dir, metadata, main_id, feature_id, db_id) = setup();
        let tracker = ChangeTracker::new(metadata.clone());
        let main = metadata.get_branch_by_id(&main_id).unwrap().unwrap();

        let c2 = tracker
            .add_change(&db_id, &main.id, &main.name, ChangeType::CreateTable, "table", "t2", &Json::Object(Default::default()), None)
            .unwrap();
        tracker.mark_applied(&main.id, &c2.id).unwrap();

        let comparator = ChangeComparator::new(&metadata);
        assert!(comparator.can_fast_forward_merge(&main_id, &feature_id).unwrap());

        let divergent = comparator.get_divergent_changes(&main_id, &feature_id).unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].change.entity_name, "t2");
    }

    #[test]
    fn conflicting_changes_on_same_entity_are_detected() {
        let (_dir, metadata, main_id, feature_id, db_id) = setup();
        let tracker = ChangeTracker::new(metadata.clone());
        let main = metadata.get_branch_by_id(&main_id).unwrap().unwrap();
        let feature = metadata.get_branch_by_id(&feature_id).unwrap().unwrap();

        let c2 = tracker
            .add_change(&db_id, &main.id, &main.name, ChangeType::AddColumn, "table", "t1", &Json::Object(Default::default()), None)
            .unwrap();
        tracker.mark_applied(&main.id, &c2.id).unwrap();

        let c3 = tracker
            .add_change(&db_id, &feature.id, &feature.name, ChangeType::DropColumn, "table", "t1", &Json::Object(Default::default()), None)
            .unwrap();
        tracker.mark_applied(&feature.id, &c3.id).unwrap();

        let comparator = ChangeComparator::new(&metadata);
        assert!(!comparator.can_fast_forward_merge(&main_id, &feature_id).unwrap());

        let conflicts = comparator.detect_conflicts(&main_id, &feature_id).unwrap();
        assert_eq!(conflicts.len(), 1);
    }
}
