// Lock registry: the local cache of lock, conflict, loading, and error state.
//
// The registry performs no I/O and never fails. Unknown component ids read as
// unlocked. Every lock mutation stamps `last_updated`, which only moves forward.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use folio_common::types::{
    BulkLockOperation, BulkOperationKind, ComponentLock, EditPermission, LockConflict, LockError,
    LockType, ResolutionStrategy,
};

/// A component that is already locked, reported before a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightConflict {
    pub component_id: String,
    pub existing_lock: ComponentLock,
    pub can_override: bool,
}

/// Upper bound on retained errors.
pub const MAX_ERRORS: usize = 50;

#[derive(Debug, Default, Clone)]
pub struct LockRegistry {
    locks: BTreeMap<String, ComponentLock>,
    conflicts: Vec<LockConflict>,
    loading: BTreeSet<String>,
    global_loading: bool,
    errors: Vec<LockError>,
    sequences: BTreeMap<String, u64>,
    last_updated: Option<DateTime<Utc>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Lock mutations ──────────────────────────────────────────────

    /// Replace the whole lock map (full resync).
    pub fn set_all(&mut self, locks: BTreeMap<String, ComponentLock>, now: DateTime<Utc>) {
        self.locks = locks;
        self.stamp(now);
    }

    pub fn upsert(&mut self, component_id: &str, lock: ComponentLock, now: DateTime<Utc>) {
        self.locks.insert(component_id.to_string(), lock);
        self.stamp(now);
    }

    pub fn remove(&mut self, component_id: &str, now: DateTime<Utc>) -> Option<ComponentLock> {
        let removed = self.locks.remove(component_id);
        self.stamp(now);
        removed
    }

    /// Put a component back into a previously captured state.
    pub fn restore(&mut self, component_id: &str, state: Option<ComponentLock>, now: DateTime<Utc>) {
        match state {
            Some(lock) => self.upsert(component_id, lock, now),
            None => {
                self.remove(component_id, now);
            }
        }
    }

    /// Apply bulk operations in order. Returns the components that changed.
    pub fn bulk_apply(
        &mut self,
        operations: &[BulkLockOperation],
        acting_user: &str,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        let mut affected = Vec::new();
        for operation in operations {
            for component_id in &operation.component_ids {
                let changed = match (operation.kind, operation.lock_level) {
                    (BulkOperationKind::Lock, Some(level)) => {
                        let mut lock = ComponentLock::new(
                            component_id.clone(),
                            level,
                            LockType::Personal,
                            operation.reason.clone(),
                            acting_user,
                            now,
                        )
                        .with_override(true);
                        lock.id = format!("bulk-lock-{}-{component_id}", now.timestamp_millis());
                        self.locks.insert(component_id.clone(), lock);
                        true
                    }
                    (BulkOperationKind::Unlock, _) => self.locks.remove(component_id).is_some(),
                    (BulkOperationKind::ChangeLevel, Some(level)) => {
                        match self.locks.get_mut(component_id) {
                            Some(lock) => {
                                lock.level = level;
                                lock.reason = operation.reason.clone();
                                true
                            }
                            None => false,
                        }
                    }
                    (_, None) => false,
                };
                if changed && !affected.contains(component_id) {
                    affected.push(component_id.clone());
                }
            }
        }
        self.stamp(now);
        affected
    }

    /// Record a server sequence for a component. Returns false when `sequence`
    /// is not newer than the last one applied.
    pub fn accept_sequence(&mut self, component_id: &str, sequence: u64) -> bool {
        match self.sequences.get(component_id) {
            Some(last) if *last >= sequence => false,
            _ => {
                self.sequences.insert(component_id.to_string(), sequence);
                true
            }
        }
    }

    fn stamp(&mut self, now: DateTime<Utc>) {
        self.last_updated = Some(self.last_updated.map_or(now, |last| last.max(now)));
    }

    // ── Conflicts ───────────────────────────────────────────────────

    /// Add a conflict; a conflict with the same id is replaced.
    pub fn add_conflict(&mut self, conflict: LockConflict) {
        match self.conflicts.iter_mut().find(|c| c.id == conflict.id) {
            Some(existing) => *existing = conflict,
            None => self.conflicts.push(conflict),
        }
    }

    pub fn remove_conflict(&mut self, conflict_id: &str) -> Option<LockConflict> {
        let index = self.conflicts.iter().position(|c| c.id == conflict_id)?;
        Some(self.conflicts.remove(index))
    }

    /// Close a conflict. Executing the strategy is the resolver's job; the
    /// registry only records that the conflict is gone.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: ResolutionStrategy,
    ) -> Option<LockConflict> {
        let removed = self.remove_conflict(conflict_id);
        if removed.is_some() {
            debug!(conflict_id, resolution = resolution.as_str(), "conflict closed");
        }
        removed
    }

    /// Add conflicts whose id is not already known.
    pub fn merge_conflicts(&mut self, conflicts: impl IntoIterator<Item = LockConflict>) {
        for conflict in conflicts {
            if self.conflict(&conflict.id).is_none() {
                self.conflicts.push(conflict);
            }
        }
    }

    // ── Busy flags and errors ───────────────────────────────────────

    pub fn set_loading(&mut self, component_id: &str, loading: bool) {
        if loading {
            self.loading.insert(component_id.to_string());
        } else {
            self.loading.remove(component_id);
        }
    }

    pub fn set_global_loading(&mut self, loading: bool) {
        self.global_loading = loading;
    }

    /// Record an error, replacing any earlier one of the same kind for the
    /// same component. The oldest entries fall off past `MAX_ERRORS`.
    pub fn record_error(&mut self, error: LockError) {
        self.errors
            .retain(|e| !(e.kind == error.kind && e.component_id == error.component_id));
        self.errors.push(error);
        if self.errors.len() > MAX_ERRORS {
            let excess = self.errors.len() - MAX_ERRORS;
            self.errors.drain(..excess);
        }
    }

    pub fn clear_errors_for(&mut self, component_id: &str) {
        self.errors.retain(|e| e.component_id.as_deref() != Some(component_id));
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    // ── Selectors ───────────────────────────────────────────────────

    pub fn lock_for_component(&self, component_id: &str) -> Option<&ComponentLock> {
        self.locks.get(component_id)
    }

    /// Like `lock_for_component`, but an expired lock reads as absent.
    pub fn active_lock_for_component(
        &self,
        component_id: &str,
        now: DateTime<Utc>,
    ) -> Option<&ComponentLock> {
        self.locks.get(component_id).filter(|lock| !lock.is_expired_at(now))
    }

    pub fn locks(&self) -> &BTreeMap<String, ComponentLock> {
        &self.locks
    }

    /// Current state of each component, for snapshots.
    pub fn snapshot<'a, I>(&self, component_ids: I) -> BTreeMap<String, Option<ComponentLock>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        component_ids
            .into_iter()
            .map(|id| (id.clone(), self.locks.get(id).cloned()))
            .collect()
    }

    pub fn conflict(&self, conflict_id: &str) -> Option<&LockConflict> {
        self.conflicts.iter().find(|c| c.id == conflict_id)
    }

    pub fn conflicts(&self) -> &[LockConflict] {
        &self.conflicts
    }

    pub fn conflicts_for_component(&self, component_id: &str) -> Vec<&LockConflict> {
        self.conflicts.iter().filter(|c| c.component_id == component_id).collect()
    }

    /// Conflicts grouped by component, for display.
    pub fn conflicts_by_component(&self) -> BTreeMap<&str, Vec<&LockConflict>> {
        let mut grouped: BTreeMap<&str, Vec<&LockConflict>> = BTreeMap::new();
        for conflict in &self.conflicts {
            grouped.entry(conflict.component_id.as_str()).or_default().push(conflict);
        }
        grouped
    }

    pub fn is_loading(&self, component_id: &str) -> bool {
        self.global_loading || self.loading.contains(component_id)
    }

    pub fn is_globally_loading(&self) -> bool {
        self.global_loading
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[LockError] {
        &self.errors
    }

    pub fn errors_for_component(&self, component_id: &str) -> Vec<&LockError> {
        self.errors.iter().filter(|e| e.component_id.as_deref() == Some(component_id)).collect()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        self.last_updated.is_none_or(|updated| now - updated > max_age)
    }

    pub fn edit_permission(
        &self,
        component_id: &str,
        user: &str,
        now: DateTime<Utc>,
    ) -> EditPermission {
        self.locks
            .get(component_id)
            .map_or(EditPermission::Allowed, |lock| lock.permission_for(user, now))
    }

    /// Components in `component_ids` that already carry a lock.
    pub fn preflight<'a, I>(&self, component_ids: I) -> Vec<PreflightConflict>
    where
        I: IntoIterator<Item = &'a str>,
    {
        component_ids
            .into_iter()
            .filter_map(|id| {
                self.locks.get(id).map(|lock| PreflightConflict {
                    component_id: id.to_string(),
                    existing_lock: lock.clone(),
                    can_override: lock.can_be_overridden(),
                })
            })
            .collect()
    }
}
