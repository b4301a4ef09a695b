// Offline change queue: durable replay of writes made while disconnected.
//
// Changes flow through a state machine:
//   pending → syncing → synced    (removed from storage)
//   pending → syncing → conflict  (kept until the conflict is resolved)
//   pending → syncing → pending   (failed, retried on the next drain)
//
// Replay order is ascending (timestamp, sequence). Every state change is
// written through to the key-value store before the next request goes out,
// so a crash mid-drain loses nothing; a change found in `syncing` on load is
// reset to `pending`.
//
// Keys are `offline-change:{project_id}:{change_id}`. Several projects may
// share one database; a queue only ever sees its own project's entries.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use folio_common::protocol::api::{LockResponse, SyncChangeRequest, SyncResponse};
use folio_common::types::{
    ChangeConflict, ComponentLock, ErrorKind, LockConflict, LockError, OfflineChange, SyncStatus,
};

use crate::registry::LockRegistry;
use crate::store::KeyValueStore;
use crate::transport::SyncApi;

const KEY_PREFIX: &str = "offline-change:";

fn project_prefix(project_id: &str) -> String {
    format!("{KEY_PREFIX}{project_id}:")
}

fn storage_key(project_id: &str, change_id: &str) -> String {
    format!("{}{change_id}", project_prefix(project_id))
}

// ── Types ───────────────────────────────────────────────────────────

/// Connectivity state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityIndicator {
    Online,
    WorkingOffline,
    /// Back online with queued changes still replaying.
    ReconnectedSyncing,
}

/// What a drain pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DrainReport {
    /// Changes accepted by the server, in replay order.
    pub synced: Vec<String>,
    /// Changes the server rejected with a conflict.
    pub conflicts: Vec<String>,
    /// Changes that failed and went back to `pending`.
    pub failed: Vec<String>,
    /// True when the drain was skipped because one was already running.
    pub skipped: bool,
}

// ── Queue ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct OfflineQueue<S: KeyValueStore> {
    store: S,
    project_id: String,
    changes: Vec<OfflineChange>,
    online: bool,
    indicator: ConnectivityIndicator,
    draining: bool,
    next_sequence: u64,
}

impl<S: KeyValueStore> OfflineQueue<S> {
    /// Restore `project_id`'s queued changes from `store`. Synced leftovers
    /// are dropped and interrupted `syncing` entries go back to `pending`.
    pub fn load(mut store: S, project_id: impl Into<String>, online: bool) -> Result<Self> {
        let project_id = project_id.into();
        let prefix = project_prefix(&project_id);
        let mut changes = Vec::new();
        for key in store.keys().context("failed to list offline changes")? {
            // Change ids never contain ':', so a longer remainder belongs to a
            // project whose id extends this one.
            match key.strip_prefix(&prefix) {
                Some(change_id) if !change_id.contains(':') => {}
                _ => continue,
            }
            let Some(raw) = store.get(&key)? else {
                continue;
            };
            let mut change: OfflineChange = match serde_json::from_str(&raw) {
                Ok(change) => change,
                Err(error) => {
                    warn!(key = %key, %error, "dropping unreadable offline change");
                    store.remove(&key)?;
                    continue;
                }
            };
            match change.sync_status {
                SyncStatus::Synced => {
                    store.remove(&key)?;
                    continue;
                }
                SyncStatus::Syncing => {
                    change.sync_status = SyncStatus::Pending;
                    persist(&mut store, &project_id, &change)?;
                }
                SyncStatus::Pending | SyncStatus::Conflict => {}
            }
            changes.push(change);
        }

        changes.sort_by(|a, b| (a.timestamp, a.sequence).cmp(&(b.timestamp, b.sequence)));
        let next_sequence = changes.iter().map(|c| c.sequence + 1).max().unwrap_or(0);
        if !changes.is_empty() {
            info!(%project_id, restored = changes.len(), "restored offline change queue");
        }

        Ok(Self {
            store,
            project_id,
            changes,
            online,
            indicator: if online {
                ConnectivityIndicator::Online
            } else {
                ConnectivityIndicator::WorkingOffline
            },
            draining: false,
            next_sequence,
        })
    }

    /// Persist a new change as `pending`. Returns its id.
    pub fn enqueue(&mut self, mut change: OfflineChange) -> Result<String> {
        change.sync_status = SyncStatus::Pending;
        change.sequence = self.next_sequence;
        self.next_sequence += 1;
        persist(&mut self.store, &self.project_id, &change)?;

        debug!(
            change_id = %change.id,
            change_type = change.change_type.as_str(),
            entity = change.entity.as_str(),
            "offline change queued"
        );
        let id = change.id.clone();
        let position = self
            .changes
            .partition_point(|c| (c.timestamp, c.sequence) <= (change.timestamp, change.sequence));
        self.changes.insert(position, change);
        Ok(id)
    }

    /// Queue a change and, when online, try to sync just that change.
    /// Older pending changes wait for the next drain.
    pub fn submit(
        &mut self,
        change: OfflineChange,
        api: &mut dyn SyncApi,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> Result<Option<DrainReport>> {
        let change_id = self.enqueue(change)?;
        if !self.online {
            return Ok(None);
        }
        if self.draining {
            debug!(%change_id, "offline drain running; change left queued");
            return Ok(Some(DrainReport { skipped: true, ..DrainReport::default() }));
        }

        self.draining = true;
        let mut report = DrainReport::default();
        let result = self.sync_one(&change_id, api, registry, now, &mut report);
        self.draining = false;
        result.map(|()| Some(report))
    }

    /// Replay pending changes in order. Conflicts are surfaced to the
    /// registry; failures stay queued for the next drain.
    pub fn drain_queue(
        &mut self,
        api: &mut dyn SyncApi,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> Result<DrainReport> {
        if self.draining {
            debug!("offline drain already running");
            return Ok(DrainReport { skipped: true, ..DrainReport::default() });
        }
        self.draining = true;
        let result = self.drain_pending(api, registry, now);
        self.draining = false;

        if self.online && self.indicator == ConnectivityIndicator::ReconnectedSyncing {
            self.indicator = ConnectivityIndicator::Online;
        }
        result
    }

    fn drain_pending(
        &mut self,
        api: &mut dyn SyncApi,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        let pending: Vec<String> = self
            .changes
            .iter()
            .filter(|c| c.sync_status == SyncStatus::Pending)
            .map(|c| c.id.clone())
            .collect();

        for change_id in pending {
            self.sync_one(&change_id, api, registry, now, &mut report)?;
        }

        if !report.synced.is_empty() || !report.conflicts.is_empty() || !report.failed.is_empty() {
            info!(
                synced = report.synced.len(),
                conflicts = report.conflicts.len(),
                failed = report.failed.len(),
                "offline queue drained"
            );
        }
        Ok(report)
    }

    fn sync_one(
        &mut self,
        change_id: &str,
        api: &mut dyn SyncApi,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
        report: &mut DrainReport,
    ) -> Result<()> {
        let Some(change) = self.set_status(change_id, SyncStatus::Syncing)? else {
            return Ok(());
        };
        let request = SyncChangeRequest { change: change.clone(), client_timestamp: now };
        let component_id = change.component_id().map(str::to_string);

        match api.sync_change(&request) {
            Ok(SyncResponse::Synced) => {
                self.remove_change(change_id)?;
                debug!(%change_id, endpoint = %request.endpoint(), "offline change synced");
                report.synced.push(change_id.to_string());
            }
            Ok(SyncResponse::Conflict { server_state }) => {
                let conflict = LockConflict::offline_change(
                    &change,
                    component_id.clone().unwrap_or_else(|| change.entity.as_str().to_string()),
                    server_state.clone(),
                    now,
                );
                self.mark_conflicted(
                    change_id,
                    ChangeConflict {
                        conflict_id: conflict.id.clone(),
                        server_state,
                        detected_at: now,
                    },
                )?;
                registry.record_error(
                    LockError::new(
                        ErrorKind::Conflict,
                        component_id,
                        conflict.description.clone(),
                        now,
                    )
                    .high(),
                );
                info!(%change_id, conflict_id = %conflict.id, "offline change conflicted");
                registry.add_conflict(conflict);
                report.conflicts.push(change_id.to_string());
            }
            Ok(SyncResponse::Failed { status, message }) => {
                self.set_status(change_id, SyncStatus::Pending)?;
                warn!(%change_id, status, reason = %message, "offline change rejected; will retry");
                registry.record_error(LockError::new(
                    LockResponse::error_kind_for_status(status),
                    component_id,
                    format!("offline change failed to sync ({status}): {message}"),
                    now,
                ));
                report.failed.push(change_id.to_string());
            }
            Err(error) => {
                self.set_status(change_id, SyncStatus::Pending)?;
                warn!(%change_id, error = %error, "offline change sync failed; will retry");
                registry.record_error(LockError::new(
                    ErrorKind::Network,
                    component_id,
                    format!("offline change failed to sync: {error:#}"),
                    now,
                ));
                report.failed.push(change_id.to_string());
            }
        }
        Ok(())
    }

    /// Conflicts recorded on restored changes, keyed by their original ids.
    /// A session feeds these to its registry so they can still be resolved.
    pub fn restored_conflicts(&self) -> Vec<LockConflict> {
        self.conflicted().filter_map(LockConflict::recorded_on).collect()
    }

    /// Track connectivity. Going from offline to online replays the queue.
    pub fn set_online(
        &mut self,
        online: bool,
        api: &mut dyn SyncApi,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> Result<Option<DrainReport>> {
        let was_online = std::mem::replace(&mut self.online, online);
        match (was_online, online) {
            (false, true) => {
                info!(pending = self.pending_count(), "back online");
                self.indicator = ConnectivityIndicator::ReconnectedSyncing;
                self.drain_queue(api, registry, now).map(Some)
            }
            (true, false) => {
                info!("working offline");
                self.indicator = ConnectivityIndicator::WorkingOffline;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Drop a change from memory and storage (after sync or resolution).
    pub fn remove_change(&mut self, change_id: &str) -> Result<Option<OfflineChange>> {
        self.store
            .remove(&storage_key(&self.project_id, change_id))
            .with_context(|| format!("failed to delete offline change `{change_id}`"))?;
        let position = self.changes.iter().position(|c| c.id == change_id);
        Ok(position.map(|index| self.changes.remove(index)))
    }

    fn set_status(&mut self, change_id: &str, status: SyncStatus) -> Result<Option<OfflineChange>> {
        let Some(change) = self.changes.iter_mut().find(|c| c.id == change_id) else {
            return Ok(None);
        };
        change.sync_status = status;
        let updated = change.clone();
        persist(&mut self.store, &self.project_id, &updated)?;
        Ok(Some(updated))
    }

    fn mark_conflicted(&mut self, change_id: &str, record: ChangeConflict) -> Result<()> {
        let Some(change) = self.changes.iter_mut().find(|c| c.id == change_id) else {
            return Ok(());
        };
        change.sync_status = SyncStatus::Conflict;
        change.conflict = Some(record);
        let updated = change.clone();
        persist(&mut self.store, &self.project_id, &updated)
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn change(&self, change_id: &str) -> Option<&OfflineChange> {
        self.changes.iter().find(|c| c.id == change_id)
    }

    /// All queued changes in replay order.
    pub fn changes(&self) -> &[OfflineChange] {
        &self.changes
    }

    pub fn pending_count(&self) -> usize {
        self.changes.iter().filter(|c| c.sync_status == SyncStatus::Pending).count()
    }

    pub fn conflicted(&self) -> impl Iterator<Item = &OfflineChange> {
        self.changes.iter().filter(|c| c.sync_status == SyncStatus::Conflict)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn indicator(&self) -> ConnectivityIndicator {
        self.indicator
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }
}

fn persist<S: KeyValueStore>(store: &mut S, project_id: &str, change: &OfflineChange) -> Result<()> {
    let encoded = serde_json::to_string(change).context("failed to encode offline change")?;
    store
        .set(&storage_key(project_id, &change.id), &encoded)
        .with_context(|| format!("failed to persist offline change `{}`", change.id))
}

/// Payload recorded for a lock change: `{"componentId", "lock"}` with a null
/// lock for unlocks.
pub fn lock_change_data(component_id: &str, lock: Option<&ComponentLock>) -> serde_json::Value {
    serde_json::json!({ "componentId": component_id, "lock": lock })
}
