// Conflict resolution: pick a side (or merge), tell the server, then clean up.
//
// Nothing changes locally until the server accepts the resolution. On
// success the conflict and its linked offline change are removed together.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{info, warn};

use folio_common::protocol::api::ConflictResolutionRequest;
use folio_common::types::{
    decode_lock_state, EntityKind, ErrorKind, LockConflict, LockError, ResolutionStrategy,
    LOCK_STATE_CONFLICT,
};

use crate::error::SyncError;
use crate::outbox::OfflineQueue;
use crate::registry::LockRegistry;
use crate::store::KeyValueStore;
use crate::transport::ResolutionApi;

type MergeFn = Box<dyn FnOnce(&Value, &Value) -> Value + Send>;

/// How to settle a conflict. `Merge` gets `(local, remote)`.
pub enum Resolution {
    Local,
    Remote,
    Merge(MergeFn),
}

impl Resolution {
    pub fn merge(f: impl FnOnce(&Value, &Value) -> Value + Send + 'static) -> Self {
        Self::Merge(Box::new(f))
    }

    pub fn strategy(&self) -> ResolutionStrategy {
        match self {
            Self::Local => ResolutionStrategy::Local,
            Self::Remote => ResolutionStrategy::Remote,
            Self::Merge(_) => ResolutionStrategy::Merge,
        }
    }
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    pub conflict: LockConflict,
    pub strategy: ResolutionStrategy,
    pub resolved_data: Value,
    /// Offline change removed along with the conflict.
    pub change_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve<S: KeyValueStore>(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        registry: &mut LockRegistry,
        queue: &mut OfflineQueue<S>,
        api: &mut dyn ResolutionApi,
        now: DateTime<Utc>,
    ) -> Result<ResolvedConflict, SyncError> {
        let conflict = registry
            .conflict(conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::ConflictNotFound(conflict_id.to_string()))?;
        let strategy = resolution.strategy();

        let resolved_data = match resolution {
            Resolution::Local => conflict.current_state.clone(),
            Resolution::Remote => conflict.conflicting_state.clone(),
            Resolution::Merge(merge) => merge(&conflict.current_state, &conflict.conflicting_state),
        };

        let request = ConflictResolutionRequest {
            change_id: conflict.change_id.clone().unwrap_or_else(|| conflict.id.clone()),
            resolution_strategy: strategy,
            resolved_data: resolved_data.clone(),
        };
        if let Err(error) = api.submit_resolution(&request) {
            warn!(conflict_id, strategy = strategy.as_str(), error = %error, "conflict resolution rejected");
            registry.record_error(LockError::new(
                ErrorKind::Network,
                Some(conflict.component_id.clone()),
                format!("conflict resolution was not accepted: {error:#}"),
                now,
            ));
            return Err(SyncError::Submission {
                conflict_id: conflict_id.to_string(),
                message: format!("{error:#}"),
            });
        }

        if carries_lock_state(&conflict, queue) {
            match decode_lock_state(&resolved_data) {
                Ok(state) => registry.restore(&conflict.component_id, state, now),
                Err(error) => {
                    warn!(conflict_id, %error, "resolved data is not a lock; registry left as is");
                }
            }
        }

        let change_id = conflict.change_id.clone();
        if let Some(change_id) = &change_id {
            queue.remove_change(change_id).map_err(SyncError::Storage)?;
        }
        registry.resolve_conflict(conflict_id, strategy);
        registry.clear_errors_for(&conflict.component_id);

        info!(
            conflict_id,
            component_id = %conflict.component_id,
            strategy = strategy.as_str(),
            "conflict resolved"
        );
        Ok(ResolvedConflict { conflict, strategy, resolved_data, change_id })
    }
}

/// Lock-state conflicts and conflicts on queued lock changes describe a
/// component lock; anything else belongs to another entity.
fn carries_lock_state<S: KeyValueStore>(conflict: &LockConflict, queue: &OfflineQueue<S>) -> bool {
    if conflict.conflict_type == LOCK_STATE_CONFLICT {
        return true;
    }
    conflict
        .change_id
        .as_deref()
        .and_then(|id| queue.change(id))
        .is_some_and(|change| change.entity == EntityKind::Lock)
}
