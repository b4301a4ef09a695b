// Optimistic operation coordinator.
//
// Every lock mutation is applied to the registry before the server sees it.
// The coordinator keeps a ledger entry per in-flight mutation holding the
// pre-mutation snapshot of each touched component:
//   applied → confirmed   (ledger entry dropped, registry keeps new value)
//   applied → rolled back (snapshot restored, error recorded)
//   applied → conflicted  (409: conflicts raised for the listed components)
// Overlapping operations each restore only their own snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::types::{
    BulkLockOperation, ComponentLock, ErrorKind, LockConflict, LockError,
};

use crate::error::SyncError;
use crate::registry::LockRegistry;
use crate::timer::TimerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationType {
    Lock,
    Unlock,
    Bulk,
}

/// The change an optimistic operation makes. Kept with the operation so a
/// retry can resend exactly what was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum LockMutation {
    Lock { component_id: String, lock: ComponentLock },
    Unlock { component_id: String },
    Bulk { operations: Vec<BulkLockOperation> },
}

impl LockMutation {
    pub fn op_type(&self) -> OperationType {
        match self {
            Self::Lock { .. } => OperationType::Lock,
            Self::Unlock { .. } => OperationType::Unlock,
            Self::Bulk { .. } => OperationType::Bulk,
        }
    }

    /// Components touched by the mutation, in first-seen order.
    pub fn component_ids(&self) -> Vec<String> {
        match self {
            Self::Lock { component_id, .. } | Self::Unlock { component_id } => {
                vec![component_id.clone()]
            }
            Self::Bulk { operations } => {
                let mut ids: Vec<String> = Vec::new();
                for id in operations.iter().flat_map(|op| op.component_ids.iter()) {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
                ids
            }
        }
    }

    fn apply(&self, registry: &mut LockRegistry, acting_user: &str, now: DateTime<Utc>) {
        match self {
            Self::Lock { component_id, lock } => registry.upsert(component_id, lock.clone(), now),
            Self::Unlock { component_id } => {
                registry.remove(component_id, now);
            }
            Self::Bulk { operations } => {
                registry.bulk_apply(operations, acting_user, now);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticOperation {
    pub id: Uuid,
    pub op_type: OperationType,
    pub component_ids: Vec<String>,
    /// When the operation was created. Fixed for the operation's lifetime.
    pub timestamp: DateTime<Utc>,
    /// Last time the request went out; staleness is measured from here.
    pub last_sent_at: DateTime<Utc>,
    /// Component state before the mutation; `None` means it was unlocked.
    pub original_state: BTreeMap<String, Option<ComponentLock>>,
    pub mutation: LockMutation,
    pub retried: bool,
    pub timeout: Option<TimerId>,
}

/// Where the dispatcher sent an applied mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Sent to the server; a response (or timeout) settles it.
    Sent,
    /// Handed to the offline queue, which now owns the deferred write.
    Deferred,
}

/// Outcome of a 409 response.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictSettlement {
    pub operation: OptimisticOperation,
    pub conflicts: Vec<LockConflict>,
    /// Components the server accepted.
    pub confirmed: Vec<String>,
}

#[derive(Debug, Default)]
pub struct OptimisticCoordinator {
    operations: BTreeMap<Uuid, OptimisticOperation>,
}

impl OptimisticCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot, apply, and dispatch a mutation.
    ///
    /// `send` receives the new ledger entry and the post-mutation state of
    /// each touched component. A dispatch error rolls the mutation back
    /// before returning.
    pub fn apply_and_send<F>(
        &mut self,
        mutation: LockMutation,
        registry: &mut LockRegistry,
        acting_user: &str,
        now: DateTime<Utc>,
        send: F,
    ) -> Result<Uuid, SyncError>
    where
        F: FnOnce(&OptimisticOperation, &BTreeMap<String, Option<ComponentLock>>) -> anyhow::Result<Dispatch>,
    {
        let component_ids = mutation.component_ids();
        let operation = OptimisticOperation {
            id: Uuid::new_v4(),
            op_type: mutation.op_type(),
            original_state: registry.snapshot(&component_ids),
            component_ids,
            timestamp: now,
            last_sent_at: now,
            mutation,
            retried: false,
            timeout: None,
        };

        operation.mutation.apply(registry, acting_user, now);
        let applied = registry.snapshot(&operation.component_ids);
        for component_id in &operation.component_ids {
            registry.set_loading(component_id, true);
        }

        match send(&operation, &applied) {
            Ok(Dispatch::Sent) => {
                debug!(
                    operation_id = %operation.id,
                    op_type = ?operation.op_type,
                    components = operation.component_ids.len(),
                    "optimistic operation sent"
                );
                let id = operation.id;
                self.operations.insert(id, operation);
                Ok(id)
            }
            Ok(Dispatch::Deferred) => {
                clear_loading(&operation, registry);
                info!(operation_id = %operation.id, "optimistic operation deferred to offline queue");
                Ok(operation.id)
            }
            Err(error) => {
                warn!(operation_id = %operation.id, error = %error, "transport rejected lock request");
                restore(&operation, registry, now);
                clear_loading(&operation, registry);
                registry.record_error(LockError::new(
                    ErrorKind::Network,
                    operation.component_ids.first().cloned(),
                    format!("lock request could not be sent: {error:#}"),
                    now,
                ));
                Err(SyncError::transport("lock request", &error))
            }
        }
    }

    /// Server accepted the operation: keep the optimistic values.
    pub fn confirm(
        &mut self,
        operation_id: Uuid,
        registry: &mut LockRegistry,
    ) -> Option<OptimisticOperation> {
        let operation = self.operations.remove(&operation_id)?;
        clear_loading(&operation, registry);
        debug!(%operation_id, "optimistic operation confirmed");
        Some(operation)
    }

    /// Restore the operation's snapshot and record an error against its
    /// first component.
    pub fn rollback(
        &mut self,
        operation_id: Uuid,
        registry: &mut LockRegistry,
        kind: ErrorKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Option<OptimisticOperation> {
        let operation = self.operations.remove(&operation_id)?;
        restore(&operation, registry, now);
        clear_loading(&operation, registry);
        registry.record_error(LockError::new(
            kind,
            operation.component_ids.first().cloned(),
            message,
            now,
        ));
        warn!(%operation_id, kind = kind.as_str(), reason = message, "optimistic operation rolled back");
        Some(operation)
    }

    /// Handle a 409. Components listed in `remote` keep their optimistic value
    /// and get a conflict; the rest count as confirmed.
    pub fn settle_conflict(
        &mut self,
        operation_id: Uuid,
        remote: &BTreeMap<String, Option<ComponentLock>>,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> Option<ConflictSettlement> {
        let operation = self.operations.remove(&operation_id)?;
        clear_loading(&operation, registry);

        let mut conflicts = Vec::new();
        let mut confirmed = Vec::new();
        for component_id in &operation.component_ids {
            match remote.get(component_id) {
                Some(remote_lock) => {
                    let conflict = LockConflict::lock_divergence(
                        component_id.clone(),
                        registry.lock_for_component(component_id),
                        remote_lock.as_ref(),
                        now,
                    );
                    registry.add_conflict(conflict.clone());
                    registry.record_error(
                        LockError::new(
                            ErrorKind::Conflict,
                            Some(component_id.clone()),
                            conflict.description.clone(),
                            now,
                        )
                        .high(),
                    );
                    conflicts.push(conflict);
                }
                None => confirmed.push(component_id.clone()),
            }
        }

        for stray in remote.keys().filter(|id| !operation.component_ids.contains(id)) {
            debug!(%operation_id, component_id = %stray, "409 named a component outside the operation");
        }
        info!(
            %operation_id,
            conflicts = conflicts.len(),
            confirmed = confirmed.len(),
            "optimistic operation hit a server conflict"
        );

        Some(ConflictSettlement { operation, conflicts, confirmed })
    }

    /// Attach the rollback timer; returns the one it replaces.
    pub fn set_timeout(&mut self, operation_id: Uuid, timer: TimerId) -> Option<TimerId> {
        let operation = self.operations.get_mut(&operation_id)?;
        operation.timeout.replace(timer)
    }

    /// Operations whose last send is older than `max_age`.
    pub fn stale_operations(&self, now: DateTime<Utc>, max_age: Duration) -> Vec<Uuid> {
        self.operations
            .values()
            .filter(|op| now - op.last_sent_at > max_age)
            .map(|op| op.id)
            .collect()
    }

    /// Record a resend. Staleness is measured from the retry from now on;
    /// the creation time (and with it the echo window) is left alone.
    pub fn mark_retried(&mut self, operation_id: Uuid, now: DateTime<Utc>) -> bool {
        match self.operations.get_mut(&operation_id) {
            Some(operation) => {
                operation.retried = true;
                operation.last_sent_at = now;
                true
            }
            None => false,
        }
    }

    pub fn operation(&self, operation_id: Uuid) -> Option<&OptimisticOperation> {
        self.operations.get(&operation_id)
    }

    pub fn operations(&self) -> impl Iterator<Item = &OptimisticOperation> {
        self.operations.values()
    }

    /// Most recent pending operation touching `component_id`.
    pub fn pending_for_component(&self, component_id: &str) -> Option<&OptimisticOperation> {
        self.operations
            .values()
            .filter(|op| op.component_ids.iter().any(|id| id == component_id))
            .max_by_key(|op| op.timestamp)
    }

    /// Whether a pending operation on `component_id` is younger than `window`.
    pub fn has_recent_pending(
        &self,
        component_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> bool {
        self.pending_for_component(component_id).is_some_and(|op| now - op.timestamp <= window)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Drop every pending operation without touching the registry.
    pub fn clear(&mut self) -> Vec<OptimisticOperation> {
        std::mem::take(&mut self.operations).into_values().collect()
    }
}

fn restore(operation: &OptimisticOperation, registry: &mut LockRegistry, now: DateTime<Utc>) {
    for (component_id, state) in &operation.original_state {
        registry.restore(component_id, state.clone(), now);
    }
}

fn clear_loading(operation: &OptimisticOperation, registry: &mut LockRegistry) {
    for component_id in &operation.component_ids {
        registry.set_loading(component_id, false);
    }
}
