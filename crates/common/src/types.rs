// Core lock domain types shared across all Folio crates.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Locks ───────────────────────────────────────────────────────────

/// Strictness of an edit restriction. Ordered: soft < hard < frozen.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockLevel {
    /// Only AI suggestions are allowed for other users.
    Soft,
    /// Edits by other users require explicit confirmation.
    Hard,
    /// Immutable for everyone, including the owner.
    Frozen,
}

impl LockLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::Frozen => "frozen",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Personal,
    Editorial,
    Collaborative,
}

/// A lock held on a single document component (character, scene, chapter).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLock {
    #[serde(default)]
    pub id: String,
    pub component_id: String,
    pub level: LockLevel,
    #[serde(rename = "type")]
    pub lock_type: LockType,
    #[serde(default)]
    pub reason: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_override: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_with: Option<BTreeSet<String>>,
}

impl ComponentLock {
    pub fn new(
        component_id: impl Into<String>,
        level: LockLevel,
        lock_type: LockType,
        reason: impl Into<String>,
        locked_by: impl Into<String>,
        locked_at: DateTime<Utc>,
    ) -> Self {
        let component_id = component_id.into();
        Self {
            id: format!("lock-{}-{component_id}", locked_at.timestamp_millis()),
            component_id,
            level,
            lock_type,
            reason: reason.into(),
            locked_by: locked_by.into(),
            locked_at,
            expires_at: None,
            can_override: None,
            shared_with: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_override(mut self, can_override: bool) -> Self {
        self.can_override = Some(can_override);
        self
    }

    pub fn shared_with<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shared_with = Some(users.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Whether another user may take this lock over. Frozen locks never can.
    pub fn can_be_overridden(&self) -> bool {
        self.can_override.unwrap_or(false) && self.level != LockLevel::Frozen
    }

    /// Whether `user` is the owner or one of the users the lock is shared with.
    pub fn grants(&self, user: &str) -> bool {
        self.locked_by == user
            || self.shared_with.as_ref().is_some_and(|shared| shared.contains(user))
    }

    /// What `user` may do to the locked component at `now`.
    pub fn permission_for(&self, user: &str, now: DateTime<Utc>) -> EditPermission {
        if self.is_expired_at(now) {
            return EditPermission::Allowed;
        }
        match self.level {
            LockLevel::Frozen => EditPermission::Denied,
            _ if self.grants(user) => EditPermission::Allowed,
            LockLevel::Soft => EditPermission::SuggestOnly,
            LockLevel::Hard => EditPermission::RequiresConfirmation,
        }
    }
}

/// Edit capability derived from the lock on a component.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EditPermission {
    Allowed,
    SuggestOnly,
    RequiresConfirmation,
    Denied,
}

// ── Bulk operations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BulkOperationKind {
    Lock,
    Unlock,
    /// Changes the level of components that are already locked.
    ChangeLevel,
}

/// One step of a bulk lock request. Steps are applied in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkLockOperation {
    #[serde(rename = "type")]
    pub kind: BulkOperationKind,
    pub component_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_level: Option<LockLevel>,
    #[serde(default)]
    pub reason: String,
}

impl BulkLockOperation {
    pub fn lock<I, S>(component_ids: I, level: LockLevel, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: BulkOperationKind::Lock,
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            lock_level: Some(level),
            reason: reason.into(),
        }
    }

    pub fn unlock<I, S>(component_ids: I, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: BulkOperationKind::Unlock,
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            lock_level: None,
            reason: reason.into(),
        }
    }

    pub fn change_level<I, S>(component_ids: I, level: LockLevel, reason: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: BulkOperationKind::ChangeLevel,
            component_ids: component_ids.into_iter().map(Into::into).collect(),
            lock_level: Some(level),
            reason: reason.into(),
        }
    }
}

// ── Conflicts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected divergence between local state and the server (or another client).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockConflict {
    pub id: String,
    pub component_id: String,
    #[serde(rename = "type")]
    pub conflict_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub current_state: Value,
    #[serde(default)]
    pub conflicting_state: Value,
    pub priority: ConflictPriority,
    #[serde(default)]
    pub affected_users: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// Offline change this conflict was raised for, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_id: Option<String>,
}

pub const LOCK_STATE_CONFLICT: &str = "lock_state";
pub const OFFLINE_CHANGE_CONFLICT: &str = "offline_change";

impl LockConflict {
    /// Conflict between the local optimistic lock and the server's lock.
    pub fn lock_divergence(
        component_id: impl Into<String>,
        local: Option<&ComponentLock>,
        remote: Option<&ComponentLock>,
        now: DateTime<Utc>,
    ) -> Self {
        let component_id = component_id.into();
        let frozen = [local, remote].into_iter().flatten().any(|l| l.level == LockLevel::Frozen);
        let affected_users: BTreeSet<String> =
            [local, remote].into_iter().flatten().map(|l| l.locked_by.clone()).collect();

        Self {
            id: Uuid::new_v4().to_string(),
            description: format!("lock state for `{component_id}` diverged from the server"),
            component_id,
            conflict_type: LOCK_STATE_CONFLICT.to_string(),
            current_state: serde_json::to_value(local).unwrap_or(Value::Null),
            conflicting_state: serde_json::to_value(remote).unwrap_or(Value::Null),
            priority: if frozen { ConflictPriority::High } else { ConflictPriority::Medium },
            affected_users: affected_users.into_iter().collect(),
            created_at: now,
            change_id: None,
        }
    }

    /// Conflict raised when the server rejects a replayed offline change.
    pub fn offline_change(
        change: &OfflineChange,
        component_id: impl Into<String>,
        server_state: Value,
        now: DateTime<Utc>,
    ) -> Self {
        let component_id = component_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            description: format!(
                "offline {} of {} `{component_id}` collided with a newer server state",
                change.change_type.as_str(),
                change.entity.as_str(),
            ),
            component_id,
            conflict_type: OFFLINE_CHANGE_CONFLICT.to_string(),
            current_state: change.data.clone(),
            conflicting_state: server_state,
            priority: ConflictPriority::High,
            affected_users: Vec::new(),
            created_at: now,
            change_id: Some(change.id.clone()),
        }
    }

    /// Rebuild the conflict recorded on a queued change, keeping its id.
    pub fn recorded_on(change: &OfflineChange) -> Option<Self> {
        let record = change.conflict.as_ref()?;
        let component_id = change.component_id().unwrap_or(change.entity.as_str()).to_string();
        Some(Self {
            id: record.conflict_id.clone(),
            ..Self::offline_change(change, component_id, record.server_state.clone(), record.detected_at)
        })
    }

    /// The server-side lock if `conflicting_state` holds a lock (or null).
    pub fn remote_lock(&self) -> Result<Option<ComponentLock>, serde_json::Error> {
        decode_lock_state(&self.conflicting_state)
    }

    /// The local lock if `current_state` holds a lock (or null).
    pub fn local_lock(&self) -> Result<Option<ComponentLock>, serde_json::Error> {
        decode_lock_state(&self.current_state)
    }
}

/// Decode a lock state value. Offline lock changes wrap the lock in
/// `{"componentId", "lock"}`; conflicts from lock responses hold the lock itself.
pub fn decode_lock_state(value: &Value) -> Result<Option<ComponentLock>, serde_json::Error> {
    match value.get("lock") {
        Some(inner) if value.get("level").is_none() => serde_json::from_value(inner.clone()),
        _ => serde_json::from_value(value.clone()),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the client's data.
    Local,
    /// Adopt the server's data.
    Remote,
    /// Combine both with a caller-supplied function.
    Merge,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Merge => "merge",
        }
    }
}

// ── Offline changes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lock,
    Component,
    Scene,
    Project,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lock => "lock",
            Self::Component => "component",
            Self::Scene => "scene",
            Self::Project => "project",
        }
    }
}

/// Offline change lifecycle:
///   pending → syncing → synced    (removed from storage)
///   pending → syncing → conflict  (kept until resolved)
///   pending → syncing → pending   (failed, retried on next drain)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Conflict,
}

/// A durable unit of deferred work recorded while disconnected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OfflineChange {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub entity: EntityKind,
    pub data: Value,
    pub sync_status: SyncStatus,
    /// Tie-breaker for changes recorded within the same timestamp.
    #[serde(default)]
    pub sequence: u64,
    /// Set when the server answered with a conflict; persisted with the
    /// change so the conflict outlives a restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ChangeConflict>,
}

/// The server's side of a conflicted offline change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeConflict {
    pub conflict_id: String,
    pub server_state: Value,
    pub detected_at: DateTime<Utc>,
}

impl OfflineChange {
    pub fn new(
        change_type: ChangeType,
        entity: EntityKind,
        data: Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp,
            change_type,
            entity,
            data,
            sync_status: SyncStatus::Pending,
            sequence: 0,
            conflict: None,
        }
    }

    /// The component this change targets, when its payload names one.
    pub fn component_id(&self) -> Option<&str> {
        self.data.get("componentId").and_then(Value::as_str)
    }
}

// ── Errors surfaced to the UI ───────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Validation,
    Permission,
    Conflict,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    Normal,
    High,
}

/// A recoverable error recorded against a component (or the session).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
    pub message: String,
    pub severity: ErrorSeverity,
    pub occurred_at: DateTime<Utc>,
}

impl LockError {
    pub fn new(
        kind: ErrorKind,
        component_id: Option<String>,
        message: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            component_id,
            message: message.into(),
            severity: ErrorSeverity::Normal,
            occurred_at,
        }
    }

    pub fn high(mut self) -> Self {
        self.severity = ErrorSeverity::High;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).single().expect("valid timestamp")
    }

    fn lock(level: LockLevel) -> ComponentLock {
        ComponentLock::new("scene-1", level, LockType::Personal, "drafting", "alice", t0())
    }

    #[test]
    fn lock_levels_are_ordered_by_strictness() {
        assert!(LockLevel::Soft < LockLevel::Hard);
        assert!(LockLevel::Hard < LockLevel::Frozen);
    }

    #[test]
    fn lock_serializes_with_camel_case_wire_names() {
        let value = serde_json::to_value(lock(LockLevel::Hard)).expect("lock should serialize");
        assert_eq!(value["componentId"], "scene-1");
        assert_eq!(value["type"], "personal");
        assert_eq!(value["level"], "hard");
        assert_eq!(value["lockedBy"], "alice");
        assert!(value.get("expiresAt").is_none());
    }

    #[test]
    fn lock_deserializes_server_payload() {
        let lock: ComponentLock = serde_json::from_value(json!({
            "id": "lock_comp123_123456789",
            "componentId": "comp123",
            "level": "soft",
            "type": "editorial",
            "reason": "Component editing",
            "lockedBy": "user123",
            "lockedAt": "2026-01-01T12:00:00Z",
            "sharedWith": [],
            "canOverride": true
        }))
        .expect("server lock should decode");

        assert_eq!(lock.level, LockLevel::Soft);
        assert_eq!(lock.lock_type, LockType::Editorial);
        assert_eq!(lock.can_override, Some(true));
        assert_eq!(lock.shared_with.as_ref().map(BTreeSet::len), Some(0));
    }

    #[test]
    fn expired_lock_allows_edits() {
        let lock = lock(LockLevel::Frozen).with_expiry(t0() + Duration::minutes(5));
        assert_eq!(lock.permission_for("bob", t0()), EditPermission::Denied);
        assert!(lock.is_expired_at(t0() + Duration::minutes(5)));
        assert_eq!(
            lock.permission_for("bob", t0() + Duration::minutes(6)),
            EditPermission::Allowed
        );
    }

    #[test]
    fn permission_depends_on_level_and_ownership() {
        let soft = lock(LockLevel::Soft).shared_with(["carol"]);
        assert_eq!(soft.permission_for("alice", t0()), EditPermission::Allowed);
        assert_eq!(soft.permission_for("carol", t0()), EditPermission::Allowed);
        assert_eq!(soft.permission_for("bob", t0()), EditPermission::SuggestOnly);

        let hard = lock(LockLevel::Hard);
        assert_eq!(hard.permission_for("bob", t0()), EditPermission::RequiresConfirmation);

        let frozen = lock(LockLevel::Frozen);
        assert_eq!(frozen.permission_for("alice", t0()), EditPermission::Denied);
    }

    #[test]
    fn frozen_locks_cannot_be_overridden() {
        assert!(lock(LockLevel::Hard).with_override(true).can_be_overridden());
        assert!(!lock(LockLevel::Frozen).with_override(true).can_be_overridden());
        assert!(!lock(LockLevel::Soft).can_be_overridden());
    }

    #[test]
    fn bulk_operation_uses_server_field_names() {
        let op = BulkLockOperation::change_level(["a", "b"], LockLevel::Hard, "upgrade");
        let value = serde_json::to_value(&op).expect("bulk op should serialize");
        assert_eq!(
            value,
            json!({
                "type": "change_level",
                "componentIds": ["a", "b"],
                "lockLevel": "hard",
                "reason": "upgrade"
            })
        );
    }

    #[test]
    fn lock_divergence_captures_both_sides() {
        let local = lock(LockLevel::Frozen);
        let mut remote = lock(LockLevel::Soft);
        remote.locked_by = "bob".to_string();

        let conflict = LockConflict::lock_divergence("scene-1", Some(&local), Some(&remote), t0());
        assert_eq!(conflict.conflict_type, LOCK_STATE_CONFLICT);
        assert_eq!(conflict.priority, ConflictPriority::High);
        assert_eq!(conflict.affected_users, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(conflict.local_lock().expect("decode"), Some(local));
        assert_eq!(conflict.remote_lock().expect("decode"), Some(remote));
    }

    #[test]
    fn remote_lock_decodes_null_as_unlocked() {
        let conflict = LockConflict::lock_divergence("scene-1", None, None, t0());
        assert_eq!(conflict.remote_lock().expect("decode"), None);
    }

    #[test]
    fn decode_lock_state_unwraps_offline_payloads() {
        let inner = lock(LockLevel::Hard);
        let wrapped = json!({ "componentId": "scene-1", "lock": inner });
        assert_eq!(decode_lock_state(&wrapped).expect("decode"), Some(inner));
        let unlocked = json!({ "componentId": "scene-1", "lock": null });
        assert_eq!(decode_lock_state(&unlocked).expect("decode"), None);
    }

    #[test]
    fn offline_change_exposes_component_id() {
        let change = OfflineChange::new(
            ChangeType::Create,
            EntityKind::Lock,
            json!({ "componentId": "scene-2" }),
            t0(),
        );
        assert_eq!(change.component_id(), Some("scene-2"));
        assert_eq!(change.sync_status, SyncStatus::Pending);

        let value = serde_json::to_value(&change).expect("change should serialize");
        assert_eq!(value["type"], "create");
        assert_eq!(value["syncStatus"], "pending");
        assert!(value.get("conflict").is_none());
    }

    #[test]
    fn recorded_conflict_is_rebuilt_with_its_id() {
        let mut change = OfflineChange::new(
            ChangeType::Update,
            EntityKind::Lock,
            json!({ "componentId": "scene-3", "lock": null }),
            t0(),
        );
        assert!(LockConflict::recorded_on(&change).is_none());

        change.sync_status = SyncStatus::Conflict;
        change.conflict = Some(ChangeConflict {
            conflict_id: "conflict-7".to_string(),
            server_state: json!({ "level": "frozen" }),
            detected_at: t0(),
        });
        let encoded = serde_json::to_string(&change).expect("change should serialize");
        let decoded: OfflineChange = serde_json::from_str(&encoded).expect("change should decode");

        let conflict = LockConflict::recorded_on(&decoded).expect("conflict recorded");
        assert_eq!(conflict.id, "conflict-7");
        assert_eq!(conflict.component_id, "scene-3");
        assert_eq!(conflict.conflict_type, OFFLINE_CHANGE_CONFLICT);
        assert_eq!(conflict.conflicting_state, json!({ "level": "frozen" }));
        assert_eq!(conflict.change_id.as_deref(), Some(change.id.as_str()));
    }
}
