// src/change_tracker.rs

//! Records DDL changes against a database and links them into a branch's
//! ordered, append-only history. `ChangeTracker` is the only writer of
//! `changes`/`branch_changes` rows; [`crate::change_applier::ChangeApplier`]
//! is the only thing that flips a link's `applied` flag to true after
//! successfully running the change's SQL.

use crate::error::Result;
use crate::metadata::models::{Change, ChangeType, TrackedChange};
use crate::metadata::MetadataStore;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::debug;

pub struct ChangeTracker {
    metadata: Arc<MetadataStore>,
}

impl ChangeTracker {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Record a new change and link it as unapplied at the end of
    /// `branch_id`'s history.
    #[allow(clippy::too_many_arguments)]
    pub fn add_change(
        &self,
        database_id: &str,
        branch_id: &str,
        branch_name: &str,
        change_type: ChangeType,
        entity_type: &str,
        entity_name: &str,
        details: &Json,
        sql: Option<&str>,
    ) -> Result<Change> {
        let change = self.metadata.create_change(
            database_id,
            Some(branch_id),
            Some(branch_name),
            change_type,
            entity_type,
            entity_name,
            details,
            sql,
        )?;
        self.metadata
            .link_change_to_branch(branch_id, branch_name, &change.id, false, None)?;
        debug!(
            change_id = change.id,
            entity = entity_name,
            branch = branch_name,
            "tracked change"
        );
        Ok(change)
    }

    /// Full ordered history for a branch, applied and unapplied alike.
    pub fn get_changes(&self, branch_id: &str) -> Result<Vec<TrackedChange>> {
        self.metadata.get_branch_changes(branch_id)
    }

    pub fn get_unapplied_changes(&self, branch_id: &str) -> Result<Vec<TrackedChange>> {
        Ok(self
            .get_changes(branch_id)?
            .into_iter()
            .filter(|c| !c.applied)
            .collect())
    }

    /// Changes linked after (not including) `applied_order == since_order`.
    pub fn get_changes_since(&self, branch_id: &str, since_order: i64) -> Result<Vec<TrackedChange>> {
        Ok(self
            .get_changes(branch_id)?
            .into_iter()
            .filter(|c| c.applied_order > since_order)
            .collect())
    }

    pub fn mark_applied(&self, branch_id: &str, change_id: &str) -> Result<()> {
        self.metadata.mark_change_applied(branch_id, change_id)
    }

    pub fn mark_unapplied(&self, branch_id: &str, change_id: &str) -> Result<()> {
        self.metadata
            .update_change_applied_status(branch_id, change_id, false)
    }

    /// Best-effort removal: unlinks the change from the branch's history
    /// without attempting to undo SQL already run against tenant files. See
    /// `DESIGN.md` for why this stays best-effort rather than a true revert.
    pub fn remove_change(&self, branch_id: &str, change_id: &str) -> Result<()> {
        self.metadata.unlink_change_from_branch(branch_id, change_id)
    }

    /// Inherit another branch's full change history onto a freshly created
    /// branch, preserving order and applied state.
    pub fn copy_branch_changes(
        &self,
        source_branch_id: &str,
        source_branch_name: &str,
        target_branch_id: &str,
        target_branch_name: &str,
    ) -> Result<usize> {
        self.metadata.copy_branch_changes(
            source_branch_id,
            source_branch_name,
            target_branch_id,
            target_branch_name,
        )
    }
}
