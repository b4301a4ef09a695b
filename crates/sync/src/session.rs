// Lock session: one project's lock state and everything that keeps it in sync.
//
// A session is opened when a project is opened and closed with it. The host
// drives it with plain method calls; asynchronous completions come back as
// later calls (`handle_lock_response`, `handle_channel_message`,
// `handle_disconnect`) and time moves only through `advance(now)`.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::protocol::api::{BulkLockRequest, LockResponse, LockUpdateRequest};
use folio_common::protocol::channel::Envelope;
use folio_common::types::{
    BulkLockOperation, ChangeType, ComponentLock, EditPermission, EntityKind, ErrorKind, LockLevel,
    LockType, OfflineChange,
};

use crate::channel::{ChannelEvent, RealtimeChannel};
use crate::config::SyncConfig;
use crate::coordinator::{
    Dispatch, LockMutation, OperationType, OptimisticCoordinator, OptimisticOperation,
};
use crate::error::SyncError;
use crate::outbox::{lock_change_data, DrainReport, OfflineQueue};
use crate::registry::{LockRegistry, PreflightConflict};
use crate::resolver::{ConflictResolver, Resolution, ResolvedConflict};
use crate::store::{KeyValueStore, SqliteStore};
use crate::timer::TimerQueue;
use crate::transport::{ChannelTransport, LockApi, ResolutionApi, SyncApi, Transports};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTimer {
    OperationTimeout(Uuid),
    RetrySweep,
}

pub struct LockSession<S: KeyValueStore> {
    config: SyncConfig,
    project_id: String,
    user_id: String,
    registry: LockRegistry,
    coordinator: OptimisticCoordinator,
    channel: RealtimeChannel<Box<dyn ChannelTransport + Send>>,
    queue: OfflineQueue<S>,
    resolver: ConflictResolver,
    lock_api: Box<dyn LockApi + Send>,
    sync_api: Box<dyn SyncApi + Send>,
    resolution_api: Box<dyn ResolutionApi + Send>,
    timers: TimerQueue<SessionTimer>,
    closed: bool,
}

impl LockSession<SqliteStore> {
    /// Open a session whose offline queue lives in the configured SQLite file.
    pub fn open_durable(
        config: SyncConfig,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        transports: Transports,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let path = config.resolved_storage_path().ok_or_else(|| {
            SyncError::Storage(anyhow::anyhow!("no storage path configured and no home directory"))
        })?;
        let store = SqliteStore::open(&path).map_err(SyncError::Storage)?;
        Self::open(config, project_id, user_id, transports, store, now)
    }
}

impl<S: KeyValueStore> LockSession<S> {
    /// Restore the project's offline queue from `store`, along with the
    /// conflicts recorded on it, and start the retry sweep. The realtime
    /// channel stays down until `connect`.
    pub fn open(
        config: SyncConfig,
        project_id: impl Into<String>,
        user_id: impl Into<String>,
        transports: Transports,
        store: S,
        now: DateTime<Utc>,
    ) -> Result<Self, SyncError> {
        let project_id = project_id.into();
        let queue =
            OfflineQueue::load(store, project_id.clone(), true).map_err(SyncError::Storage)?;
        let mut registry = LockRegistry::new();
        registry.merge_conflicts(queue.restored_conflicts());
        let channel = RealtimeChannel::new(
            project_id.clone(),
            transports.channel,
            config.timeouts.clone(),
            config.reconnect.clone(),
        );

        let mut session = Self {
            project_id,
            user_id: user_id.into(),
            registry,
            coordinator: OptimisticCoordinator::new(),
            channel,
            queue,
            resolver: ConflictResolver::new(),
            lock_api: transports.locks,
            sync_api: transports.sync,
            resolution_api: transports.resolution,
            timers: TimerQueue::new(),
            closed: false,
            config,
        };
        session.arm_retry_sweep(now);
        info!(
            project_id = %session.project_id,
            user_id = %session.user_id,
            queued_changes = session.queue.changes().len(),
            open_conflicts = session.registry.conflicts().len(),
            "lock session opened"
        );
        Ok(session)
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed {
            return Err(SyncError::Closed);
        }
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn registry(&self) -> &LockRegistry {
        &self.registry
    }

    pub fn coordinator(&self) -> &OptimisticCoordinator {
        &self.coordinator
    }

    pub fn queue(&self) -> &OfflineQueue<S> {
        &self.queue
    }

    pub fn channel(&self) -> &RealtimeChannel<Box<dyn ChannelTransport + Send>> {
        &self.channel
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// What the session user may do to `component_id` right now.
    pub fn edit_permission(&self, component_id: &str, now: DateTime<Utc>) -> EditPermission {
        self.registry.edit_permission(component_id, &self.user_id, now)
    }

    pub fn preflight<'a, I>(&self, component_ids: I) -> Vec<PreflightConflict>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.registry.preflight(component_ids)
    }

    /// Earliest pending timer, for hosts that sleep between `advance` calls.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [self.timers.next_deadline(), self.channel.next_deadline()].into_iter().flatten().min()
    }

    // ── Lock mutations ──────────────────────────────────────────────

    pub fn lock_component(
        &mut self,
        component_id: &str,
        level: LockLevel,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SyncError> {
        let lock =
            ComponentLock::new(component_id, level, LockType::Personal, reason, &self.user_id, now);
        self.lock_component_with(lock, now)
    }

    /// Lock with a fully specified lock (type, expiry, sharing).
    pub fn lock_component_with(
        &mut self,
        lock: ComponentLock,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SyncError> {
        let component_id = lock.component_id.clone();
        self.apply(LockMutation::Lock { component_id, lock }, now)
    }

    pub fn unlock_component(
        &mut self,
        component_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SyncError> {
        self.apply(LockMutation::Unlock { component_id: component_id.to_string() }, now)
    }

    pub fn bulk_update(
        &mut self,
        operations: Vec<BulkLockOperation>,
        now: DateTime<Utc>,
    ) -> Result<Uuid, SyncError> {
        self.apply(LockMutation::Bulk { operations }, now)
    }

    /// Apply a mutation optimistically and route it to the server (online)
    /// or the offline queue (offline).
    pub fn apply(&mut self, mutation: LockMutation, now: DateTime<Utc>) -> Result<Uuid, SyncError> {
        self.ensure_open()?;
        let online = self.queue.is_online();
        let project_id = self.project_id.as_str();
        let lock_api = &mut self.lock_api;
        let queue = &mut self.queue;

        let operation_id = self.coordinator.apply_and_send(
            mutation,
            &mut self.registry,
            &self.user_id,
            now,
            |operation, applied| {
                if online {
                    send_mutation(lock_api.as_mut(), project_id, operation.id, &operation.mutation)?;
                    return Ok(Dispatch::Sent);
                }
                for change in offline_changes(operation, applied, now) {
                    queue.enqueue(change)?;
                }
                Ok(Dispatch::Deferred)
            },
        )?;

        if let Some(op_type) = self.coordinator.operation(operation_id).map(|op| op.op_type) {
            self.arm_operation_timeout(operation_id, op_type, now);
        }
        Ok(operation_id)
    }

    fn arm_operation_timeout(&mut self, operation_id: Uuid, op_type: OperationType, now: DateTime<Utc>) {
        let timeout = match op_type {
            OperationType::Bulk => self.config.timeouts.bulk_operation(),
            OperationType::Lock | OperationType::Unlock => self.config.timeouts.single_operation(),
        };
        let timer = self.timers.schedule(now + timeout, SessionTimer::OperationTimeout(operation_id));
        if let Some(previous) = self.coordinator.set_timeout(operation_id, timer) {
            self.timers.cancel(previous);
        }
    }

    /// Settle an in-flight operation with the server's answer.
    pub fn handle_lock_response(
        &mut self,
        operation_id: Uuid,
        response: LockResponse,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.ensure_open()?;
        let Some(timeout) = self.coordinator.operation(operation_id).map(|op| op.timeout) else {
            // Already rolled back (timeout) or never sent: local state may
            // now disagree with the server, so ask for the truth.
            warn!(%operation_id, ?response, "response for an operation that is no longer pending");
            if self.channel.is_connected() {
                if let Err(error) =
                    self.channel.request_sync(&mut self.registry, self.coordinator.len(), now)
                {
                    warn!(%error, "resync after late response failed");
                }
            }
            return Err(SyncError::UnknownOperation(operation_id));
        };
        if let Some(timer) = timeout {
            self.timers.cancel(timer);
        }

        match response {
            LockResponse::Confirmed => {
                if let Some(operation) = self.coordinator.confirm(operation_id, &mut self.registry) {
                    self.broadcast_components(&operation.component_ids);
                }
            }
            LockResponse::Rejected { kind, message } => {
                self.coordinator.rollback(operation_id, &mut self.registry, kind, &message, now);
            }
            LockResponse::Conflict { remote } => {
                if let Some(settlement) =
                    self.coordinator.settle_conflict(operation_id, &remote, &mut self.registry, now)
                {
                    self.broadcast_components(&settlement.confirmed);
                }
            }
        }
        Ok(())
    }

    fn broadcast_components(&mut self, component_ids: &[String]) {
        for component_id in component_ids {
            let lock = self.registry.lock_for_component(component_id).cloned();
            match self.channel.broadcast_lock_update(component_id, lock) {
                Ok(()) => {}
                Err(SyncError::NotConnected) => {
                    debug!(%component_id, "lock update not broadcast: channel down");
                }
                Err(error) => warn!(%component_id, %error, "lock update broadcast failed"),
            }
        }
    }

    // ── Realtime channel ────────────────────────────────────────────

    pub fn connect(&mut self, now: DateTime<Utc>) -> Result<ChannelEvent, SyncError> {
        self.ensure_open()?;
        self.channel.connect(&mut self.registry, self.coordinator.len(), now)
    }

    pub fn handle_channel_message(
        &mut self,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<ChannelEvent, SyncError> {
        self.ensure_open()?;
        let event = self
            .channel
            .handle_message(envelope, &mut self.registry, &self.coordinator, now)
            .inspect_err(|error| warn!(channel = %envelope.channel, %error, "inbound message rejected"))?;

        if let ChannelEvent::ConflictRemoved { removed: Some(conflict), .. } = &event {
            if let Some(change_id) = &conflict.change_id {
                self.queue.remove_change(change_id).map_err(SyncError::Storage)?;
            }
        }
        Ok(event)
    }

    pub fn handle_disconnect(&mut self, reason: &str, now: DateTime<Utc>) -> ChannelEvent {
        self.channel.handle_disconnect(reason, &mut self.registry, now)
    }

    pub fn set_visibility(&mut self, visible: bool, now: DateTime<Utc>) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        self.channel.set_visibility(visible, &mut self.registry, self.coordinator.len(), now)
    }

    // ── Offline queue ───────────────────────────────────────────────

    /// Track network availability. Coming back online replays the offline
    /// queue and reconnects the channel if it is down.
    pub fn set_online(
        &mut self,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<DrainReport>, SyncError> {
        self.ensure_open()?;
        let report = self
            .queue
            .set_online(online, self.sync_api.as_mut(), &mut self.registry, now)
            .map_err(SyncError::Storage)?;
        if online && !self.channel.is_connected() {
            self.channel.connect(&mut self.registry, self.coordinator.len(), now)?;
        }
        Ok(report)
    }

    pub fn drain_offline_queue(&mut self, now: DateTime<Utc>) -> Result<DrainReport, SyncError> {
        self.ensure_open()?;
        self.queue
            .drain_queue(self.sync_api.as_mut(), &mut self.registry, now)
            .map_err(SyncError::Storage)
    }

    /// Record a non-lock change (scene, component, project) for replay.
    pub fn record_offline_change(
        &mut self,
        change: OfflineChange,
        now: DateTime<Utc>,
    ) -> Result<Option<DrainReport>, SyncError> {
        self.ensure_open()?;
        self.queue
            .submit(change, self.sync_api.as_mut(), &mut self.registry, now)
            .map_err(SyncError::Storage)
    }

    // ── Conflicts ───────────────────────────────────────────────────

    pub fn resolve_conflict(
        &mut self,
        conflict_id: &str,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<ResolvedConflict, SyncError> {
        self.ensure_open()?;
        let resolved = self.resolver.resolve(
            conflict_id,
            resolution,
            &mut self.registry,
            &mut self.queue,
            self.resolution_api.as_mut(),
            now,
        )?;

        match self.channel.broadcast_conflict_resolution(
            conflict_id,
            resolved.strategy,
            resolved.resolved_data.clone(),
            now,
        ) {
            Ok(()) | Err(SyncError::NotConnected) => {}
            Err(error) => warn!(conflict_id, %error, "conflict resolution broadcast failed"),
        }
        Ok(resolved)
    }

    // ── Time ────────────────────────────────────────────────────────

    /// Fire every timer due at `now`: operation timeouts, the retry sweep,
    /// and the channel's reconnect and sync timers.
    pub fn advance(&mut self, now: DateTime<Utc>) -> Vec<ChannelEvent> {
        if self.closed {
            return Vec::new();
        }
        for (_, timer) in self.timers.pop_due(now) {
            match timer {
                SessionTimer::OperationTimeout(operation_id) => {
                    self.coordinator.rollback(
                        operation_id,
                        &mut self.registry,
                        ErrorKind::Network,
                        "lock request timed out",
                        now,
                    );
                }
                SessionTimer::RetrySweep => {
                    self.sweep_stale(now);
                    self.arm_retry_sweep(now);
                }
            }
        }
        self.channel.advance(&mut self.registry, self.coordinator.len(), now)
    }

    fn arm_retry_sweep(&mut self, now: DateTime<Utc>) {
        let deadline = now + self.config.timeouts.retry_sweep_interval();
        self.timers.schedule(deadline, SessionTimer::RetrySweep);
    }

    /// Resend operations that went unanswered for too long, once. An
    /// operation that goes stale again is rolled back.
    fn sweep_stale(&mut self, now: DateTime<Utc>) {
        let stale = self.coordinator.stale_operations(now, self.config.timeouts.stale_operation());
        for operation_id in stale {
            let Some(operation) = self.coordinator.operation(operation_id) else {
                continue;
            };
            let (retried, op_type, mutation) =
                (operation.retried, operation.op_type, operation.mutation.clone());
            if let Some(timer) = operation.timeout {
                self.timers.cancel(timer);
            }

            if retried {
                self.coordinator.rollback(
                    operation_id,
                    &mut self.registry,
                    ErrorKind::Network,
                    "lock request went unanswered after a retry",
                    now,
                );
                continue;
            }

            match send_mutation(self.lock_api.as_mut(), &self.project_id, operation_id, &mutation) {
                Ok(()) => {
                    self.coordinator.mark_retried(operation_id, now);
                    self.arm_operation_timeout(operation_id, op_type, now);
                    info!(%operation_id, "stale lock request resent");
                }
                Err(error) => {
                    self.coordinator.rollback(
                        operation_id,
                        &mut self.registry,
                        ErrorKind::Network,
                        &format!("lock request retry could not be sent: {error:#}"),
                        now,
                    );
                }
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Disconnect and cancel all timers. Pending operations are dropped.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.channel.close(&mut self.registry);
        self.timers.clear();
        let dropped = self.coordinator.clear();
        self.closed = true;
        info!(
            project_id = %self.project_id,
            dropped_operations = dropped.len(),
            "lock session closed"
        );
    }
}

impl<S: KeyValueStore> Drop for LockSession<S> {
    fn drop(&mut self) {
        self.close();
    }
}

fn send_mutation(
    api: &mut dyn LockApi,
    project_id: &str,
    operation_id: Uuid,
    mutation: &LockMutation,
) -> anyhow::Result<()> {
    match mutation {
        LockMutation::Lock { component_id, lock } => api.update_lock(
            operation_id,
            &LockUpdateRequest {
                project_id: project_id.to_string(),
                component_id: component_id.clone(),
                lock: Some(lock.clone()),
            },
        ),
        LockMutation::Unlock { component_id } => api.update_lock(
            operation_id,
            &LockUpdateRequest {
                project_id: project_id.to_string(),
                component_id: component_id.clone(),
                lock: None,
            },
        ),
        LockMutation::Bulk { operations } => api.bulk_update(
            operation_id,
            &BulkLockRequest { project_id: project_id.to_string(), operations: operations.clone() },
        ),
    }
}

/// One lock change per component whose state the operation changed.
fn offline_changes(
    operation: &OptimisticOperation,
    applied: &std::collections::BTreeMap<String, Option<ComponentLock>>,
    now: DateTime<Utc>,
) -> Vec<OfflineChange> {
    operation
        .component_ids
        .iter()
        .filter_map(|component_id| {
            let before = operation.original_state.get(component_id).cloned().flatten();
            let after = applied.get(component_id).cloned().flatten();
            let change_type = match (&before, &after) {
                (None, None) => return None,
                (Some(old), Some(new)) if old == new => return None,
                (None, Some(_)) => ChangeType::Create,
                (Some(_), Some(_)) => ChangeType::Update,
                (Some(_), None) => ChangeType::Delete,
            };
            Some(OfflineChange::new(
                change_type,
                EntityKind::Lock,
                lock_change_data(component_id, after.as_ref()),
                now,
            ))
        })
        .collect()
}
