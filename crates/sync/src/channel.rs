// Realtime sync channel: the persistent project connection.
//
// Connection lifecycle:
//   Disconnected → Connecting → Connected
//   Connected → Reconnecting → Connecting   (on drop, after backoff)
//   Connecting → Reconnecting               (on failed attempt, backoff doubles)
//
// Reconnection never gives up. Once consecutive failures reach the configured
// attempt count a single high-severity error is recorded and retries continue
// at the capped delay.
//
// Transport is abstracted via `ChannelTransport` for testability.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use folio_common::protocol::channel::{
    ClientMessage, ConflictResolutionBroadcast, Envelope, LockUpdate, ServerMessage, SyncRequest,
    SyncSnapshot,
};
use folio_common::types::{
    ComponentLock, ErrorKind, LockConflict, LockError, ResolutionStrategy,
};

use crate::config::{ReconnectConfig, TimeoutConfig};
use crate::coordinator::OptimisticCoordinator;
use crate::error::SyncError;
use crate::registry::LockRegistry;
use crate::timer::{TimerId, TimerQueue};
use crate::transport::ChannelTransport;

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out the backoff before the next connection attempt.
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelTimer {
    Reconnect,
    SyncTimeout,
    PeriodicSync,
}

// ── Events ──────────────────────────────────────────────────────────

/// What the channel did in response to a call.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected { reason: String },
    LockApplied { component_id: String },
    /// Remote update dropped as an echo of our own pending write.
    EchoIgnored { component_id: String },
    /// Remote update dropped because a newer sequence was already applied.
    StaleIgnored { component_id: String, sequence: u64 },
    ConflictAdded { conflict_id: String },
    ConflictRemoved { conflict_id: String, removed: Option<LockConflict> },
    Synced { timestamp: DateTime<Utc> },
    SyncRequested,
    SyncTimedOut,
    SyncSkipped,
    Presence { user_id: String, online: bool },
}

// ── Channel ─────────────────────────────────────────────────────────

pub struct RealtimeChannel<T: ChannelTransport> {
    project_id: String,
    transport: T,
    state: ConnectionState,
    timeouts: TimeoutConfig,
    reconnect: ReconnectConfig,
    consecutive_failures: u32,
    persistent_failure_reported: bool,
    last_sync: Option<DateTime<Utc>>,
    timers: TimerQueue<ChannelTimer>,
    sync_timer: Option<TimerId>,
    reconnect_timer: Option<TimerId>,
    periodic_timer: Option<TimerId>,
    online_users: BTreeSet<String>,
    visible: bool,
    closed: bool,
}

impl<T: ChannelTransport> RealtimeChannel<T> {
    pub fn new(
        project_id: impl Into<String>,
        transport: T,
        timeouts: TimeoutConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            transport,
            state: ConnectionState::Disconnected,
            timeouts,
            reconnect,
            consecutive_failures: 0,
            persistent_failure_reported: false,
            last_sync: None,
            timers: TimerQueue::new(),
            sync_timer: None,
            reconnect_timer: None,
            periodic_timer: None,
            online_users: BTreeSet::new(),
            visible: true,
            closed: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn online_users(&self) -> &BTreeSet<String> {
        &self.online_users
    }

    pub fn is_sync_pending(&self) -> bool {
        self.sync_timer.is_some()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Open the connection, subscribe, and request a full sync.
    ///
    /// A failed attempt is not an error: it schedules the next attempt and
    /// returns `Disconnected`.
    pub fn connect(
        &mut self,
        registry: &mut LockRegistry,
        pending_operations: usize,
        now: DateTime<Utc>,
    ) -> Result<ChannelEvent, SyncError> {
        if self.closed {
            return Err(SyncError::Closed);
        }
        if self.is_connected() {
            return Ok(ChannelEvent::Connected);
        }
        if let Some(timer) = self.reconnect_timer.take() {
            self.timers.cancel(timer);
        }
        self.state = ConnectionState::Connecting;

        if let Err(error) = self.transport.connect(&self.project_id) {
            return Ok(self.connection_failed(format!("connect failed: {error:#}"), registry, now));
        }
        self.state = ConnectionState::Connected;

        if let Err(error) = self.send(&ClientMessage::Subscribe) {
            self.transport.close();
            return Ok(self.connection_failed(format!("subscribe failed: {error}"), registry, now));
        }
        info!(
            project_id = %self.project_id,
            after_failures = self.consecutive_failures,
            "realtime channel connected"
        );
        self.consecutive_failures = 0;
        self.persistent_failure_reported = false;

        if let Err(error) = self.request_sync(registry, pending_operations, now) {
            warn!(%error, "initial sync request failed");
        }
        self.arm_periodic_sync(now);
        Ok(ChannelEvent::Connected)
    }

    fn connection_failed(
        &mut self,
        reason: String,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> ChannelEvent {
        self.consecutive_failures += 1;
        self.state = ConnectionState::Reconnecting;
        let delay = self.reconnect.delay_after(self.consecutive_failures);
        self.reconnect_timer = Some(self.timers.schedule(now + delay, ChannelTimer::Reconnect));
        warn!(
            project_id = %self.project_id,
            failures = self.consecutive_failures,
            retry_in_ms = delay.num_milliseconds(),
            %reason,
            "realtime connection attempt failed"
        );

        if self.consecutive_failures >= self.reconnect.max_attempts
            && !self.persistent_failure_reported
        {
            self.persistent_failure_reported = true;
            registry.record_error(
                LockError::new(
                    ErrorKind::Network,
                    None,
                    format!(
                        "realtime connection failed {} times in a row; still retrying",
                        self.consecutive_failures
                    ),
                    now,
                )
                .high(),
            );
        }
        ChannelEvent::Disconnected { reason }
    }

    /// The connection dropped. Schedules a reconnect after the base delay.
    pub fn handle_disconnect(
        &mut self,
        reason: &str,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> ChannelEvent {
        if self.closed || self.state == ConnectionState::Reconnecting {
            return ChannelEvent::Disconnected { reason: reason.to_string() };
        }
        self.cancel_sync_timers(registry);
        self.consecutive_failures = 0;
        self.state = ConnectionState::Reconnecting;
        let delay = self.reconnect.delay_after(1);
        self.reconnect_timer = Some(self.timers.schedule(now + delay, ChannelTimer::Reconnect));
        warn!(project_id = %self.project_id, reason, "realtime connection lost");
        ChannelEvent::Disconnected { reason: reason.to_string() }
    }

    /// Tear down for good. Later `connect` calls fail with `Closed`.
    pub fn close(&mut self, registry: &mut LockRegistry) {
        if self.closed {
            return;
        }
        self.cancel_sync_timers(registry);
        self.timers.clear();
        self.reconnect_timer = None;
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        self.closed = true;
        info!(project_id = %self.project_id, "realtime channel closed");
    }

    fn cancel_sync_timers(&mut self, registry: &mut LockRegistry) {
        if let Some(timer) = self.sync_timer.take() {
            self.timers.cancel(timer);
            registry.set_global_loading(false);
        }
        if let Some(timer) = self.periodic_timer.take() {
            self.timers.cancel(timer);
        }
    }

    fn arm_periodic_sync(&mut self, now: DateTime<Utc>) {
        if let Some(timer) = self.periodic_timer.take() {
            self.timers.cancel(timer);
        }
        let deadline = now + self.timeouts.full_sync_interval();
        self.periodic_timer = Some(self.timers.schedule(deadline, ChannelTimer::PeriodicSync));
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Run every channel timer due at `now`.
    pub fn advance(
        &mut self,
        registry: &mut LockRegistry,
        pending_operations: usize,
        now: DateTime<Utc>,
    ) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        for (id, timer) in self.timers.pop_due(now) {
            match timer {
                ChannelTimer::Reconnect => {
                    self.reconnect_timer = None;
                    match self.connect(registry, pending_operations, now) {
                        Ok(event) => events.push(event),
                        Err(error) => debug!(%error, "reconnect skipped"),
                    }
                }
                ChannelTimer::SyncTimeout if self.sync_timer == Some(id) => {
                    self.sync_timer = None;
                    registry.set_global_loading(false);
                    registry.record_error(LockError::new(
                        ErrorKind::Network,
                        None,
                        "full sync request timed out",
                        now,
                    ));
                    warn!(project_id = %self.project_id, "full sync request timed out");
                    events.push(ChannelEvent::SyncTimedOut);
                }
                ChannelTimer::SyncTimeout => {}
                ChannelTimer::PeriodicSync => {
                    self.periodic_timer = None;
                    if !self.is_connected() {
                        continue;
                    }
                    self.arm_periodic_sync(now);
                    if pending_operations > 0 {
                        debug!(pending_operations, "periodic sync skipped");
                        events.push(ChannelEvent::SyncSkipped);
                        continue;
                    }
                    match self.request_sync(registry, pending_operations, now) {
                        Ok(()) => events.push(ChannelEvent::SyncRequested),
                        Err(error) => warn!(%error, "periodic sync request failed"),
                    }
                }
            }
        }
        events
    }

    // ── Outbound ────────────────────────────────────────────────────

    fn send(&mut self, message: &ClientMessage) -> Result<(), SyncError> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let envelope = message.encode(&self.project_id)?;
        self.transport
            .send(&envelope)
            .map_err(|error| SyncError::transport(envelope.channel.as_str(), &error))
    }

    /// Ask the server for the full project state. Re-arms the sync timeout.
    pub fn request_sync(
        &mut self,
        registry: &mut LockRegistry,
        pending_operations: usize,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.send(&ClientMessage::SyncRequest(SyncRequest {
            last_sync_timestamp: self.last_sync,
            pending_operations,
        }))?;

        if let Some(timer) = self.sync_timer.take() {
            self.timers.cancel(timer);
        }
        let deadline = now + self.timeouts.sync_request();
        self.sync_timer = Some(self.timers.schedule(deadline, ChannelTimer::SyncTimeout));
        registry.set_global_loading(true);
        debug!(project_id = %self.project_id, pending_operations, "full sync requested");
        Ok(())
    }

    pub fn broadcast_lock_update(
        &mut self,
        component_id: &str,
        lock: Option<ComponentLock>,
    ) -> Result<(), SyncError> {
        self.send(&ClientMessage::LockUpdate(LockUpdate {
            component_id: component_id.to_string(),
            lock,
            sequence: None,
        }))
    }

    pub fn broadcast_conflict_resolution(
        &mut self,
        conflict_id: &str,
        resolution: ResolutionStrategy,
        resolved_data: Value,
        now: DateTime<Utc>,
    ) -> Result<(), SyncError> {
        self.send(&ClientMessage::ConflictResolution(ConflictResolutionBroadcast {
            conflict_id: conflict_id.to_string(),
            resolution,
            resolved_data,
            status: "resolved".to_string(),
            timestamp: now,
        }))
    }

    /// Track page visibility. Becoming visible triggers a full sync.
    pub fn set_visibility(
        &mut self,
        visible: bool,
        registry: &mut LockRegistry,
        pending_operations: usize,
        now: DateTime<Utc>,
    ) -> Option<ChannelEvent> {
        let became_visible = visible && !self.visible;
        self.visible = visible;
        if !became_visible || !self.is_connected() {
            return None;
        }
        match self.request_sync(registry, pending_operations, now) {
            Ok(()) => Some(ChannelEvent::SyncRequested),
            Err(error) => {
                warn!(%error, "sync on visibility change failed");
                None
            }
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────

    pub fn handle_message(
        &mut self,
        envelope: &Envelope,
        registry: &mut LockRegistry,
        coordinator: &OptimisticCoordinator,
        now: DateTime<Utc>,
    ) -> Result<ChannelEvent, SyncError> {
        match ServerMessage::decode(envelope, &self.project_id)? {
            ServerMessage::LockUpdate(update) => {
                Ok(self.apply_lock_update(update, registry, coordinator, now))
            }
            ServerMessage::BulkLockUpdate(notice) => {
                debug!(affected = notice.affected_components.len(), "bulk lock update announced");
                self.request_sync(registry, coordinator.len(), now)?;
                Ok(ChannelEvent::SyncRequested)
            }
            ServerMessage::Conflict(conflict) => {
                registry.record_error(
                    LockError::new(
                        ErrorKind::Conflict,
                        Some(conflict.component_id.clone()),
                        conflict.description.clone(),
                        now,
                    )
                    .high(),
                );
                info!(
                    conflict_id = %conflict.id,
                    component_id = %conflict.component_id,
                    "conflict received"
                );
                let conflict_id = conflict.id.clone();
                registry.add_conflict(conflict);
                Ok(ChannelEvent::ConflictAdded { conflict_id })
            }
            ServerMessage::ConflictResolved(notice) => {
                let removed = registry.remove_conflict(&notice.conflict_id);
                debug!(conflict_id = %notice.conflict_id, known = removed.is_some(), "conflict resolved remotely");
                Ok(ChannelEvent::ConflictRemoved { conflict_id: notice.conflict_id, removed })
            }
            ServerMessage::SyncResponse(snapshot) => Ok(self.apply_snapshot(snapshot, registry, now)),
            ServerMessage::Presence(presence) => {
                if presence.online {
                    self.online_users.insert(presence.user_id.clone());
                } else {
                    self.online_users.remove(&presence.user_id);
                }
                info!(user_id = %presence.user_id, online = presence.online, "presence changed");
                Ok(ChannelEvent::Presence { user_id: presence.user_id, online: presence.online })
            }
            ServerMessage::PermissionChange(_) => {
                info!(project_id = %self.project_id, "permissions changed; resyncing");
                self.request_sync(registry, coordinator.len(), now)?;
                Ok(ChannelEvent::SyncRequested)
            }
        }
    }

    fn apply_lock_update(
        &mut self,
        update: LockUpdate,
        registry: &mut LockRegistry,
        coordinator: &OptimisticCoordinator,
        now: DateTime<Utc>,
    ) -> ChannelEvent {
        let component_id = update.component_id;
        match update.sequence {
            // Sequenced updates are ordered by the server; no echo guessing.
            Some(sequence) => {
                if !registry.accept_sequence(&component_id, sequence) {
                    debug!(%component_id, sequence, "stale lock update ignored");
                    return ChannelEvent::StaleIgnored { component_id, sequence };
                }
            }
            None => {
                if coordinator.has_recent_pending(&component_id, now, self.timeouts.echo_window()) {
                    debug!(%component_id, "lock update ignored as self-echo");
                    return ChannelEvent::EchoIgnored { component_id };
                }
            }
        }

        match update.lock {
            Some(lock) => registry.upsert(&component_id, lock, now),
            None => {
                registry.remove(&component_id, now);
            }
        }
        debug!(%component_id, "remote lock update applied");
        ChannelEvent::LockApplied { component_id }
    }

    fn apply_snapshot(
        &mut self,
        snapshot: SyncSnapshot,
        registry: &mut LockRegistry,
        now: DateTime<Utc>,
    ) -> ChannelEvent {
        let lock_count = snapshot.locks.len();
        registry.set_all(snapshot.locks, now);
        registry.merge_conflicts(snapshot.conflicts);
        registry.set_global_loading(false);
        if let Some(timer) = self.sync_timer.take() {
            self.timers.cancel(timer);
        }
        self.last_sync = Some(snapshot.timestamp);
        info!(project_id = %self.project_id, locks = lock_count, "full sync applied");
        ChannelEvent::Synced { timestamp: snapshot.timestamp }
    }
}
