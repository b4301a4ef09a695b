// Realtime channel messages: `{"channel": "<name>:<projectId>", "data": {...}}`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ProtocolError, CURRENT_PROTOCOL_VERSION};
use crate::types::{ComponentLock, LockConflict, ResolutionStrategy};

/// Named logical channels multiplexed over the project connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    // Server -> client.
    Locks,
    Conflicts,
    ConflictResolutions,
    SyncResponse,
    Presence,
    Permissions,
    // Client -> server.
    Subscribe,
    SyncRequest,
    LockUpdate,
    ConflictResolution,
}

impl Channel {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Locks => "locks",
            Self::Conflicts => "conflicts",
            Self::ConflictResolutions => "conflict-resolutions",
            Self::SyncResponse => "sync-response",
            Self::Presence => "presence",
            Self::Permissions => "permissions",
            Self::Subscribe => "subscribe",
            Self::SyncRequest => "sync-request",
            Self::LockUpdate => "lock-update",
            Self::ConflictResolution => "conflict-resolution",
        }
    }

    pub fn parse(prefix: &str) -> Option<Self> {
        match prefix {
            "locks" => Some(Self::Locks),
            "conflicts" => Some(Self::Conflicts),
            "conflict-resolutions" => Some(Self::ConflictResolutions),
            "sync-response" => Some(Self::SyncResponse),
            "presence" => Some(Self::Presence),
            "permissions" => Some(Self::Permissions),
            "subscribe" => Some(Self::Subscribe),
            "sync-request" => Some(Self::SyncRequest),
            "lock-update" => Some(Self::LockUpdate),
            "conflict-resolution" => Some(Self::ConflictResolution),
            _ => None,
        }
    }

    /// Whether the server sends on this channel.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::Locks
                | Self::Conflicts
                | Self::ConflictResolutions
                | Self::SyncResponse
                | Self::Presence
                | Self::Permissions
        )
    }

    /// Full channel address for a project, e.g. `locks:novel-42`.
    pub fn address(self, project_id: &str) -> String {
        format!("{}:{project_id}", self.prefix())
    }
}

/// Split `<channel>:<projectId>` at the first colon.
pub fn split_address(address: &str) -> Result<(Channel, &str), ProtocolError> {
    let (prefix, project_id) = address
        .split_once(':')
        .filter(|(_, project)| !project.is_empty())
        .ok_or_else(|| ProtocolError::MalformedChannel(address.to_string()))?;
    let channel =
        Channel::parse(prefix).ok_or_else(|| ProtocolError::UnknownChannel(prefix.to_string()))?;
    Ok((channel, project_id))
}

/// A single frame on the realtime connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub channel: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(channel: Channel, project_id: &str, data: Value) -> Self {
        Self { channel: channel.address(project_id), data }
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// A single lock change. `lock: null` means the component was unlocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockUpdate {
    pub component_id: String,
    #[serde(default)]
    pub lock: Option<ComponentLock>,
    /// Server-assigned per-component sequence, when the server provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Summary broadcast after a bulk operation; carries no lock bodies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BulkLockNotice {
    pub bulk_update: bool,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<String>,
}

/// Another party closed a conflict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolvedNotice {
    pub conflict_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Authoritative project state returned for a sync request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    #[serde(default)]
    pub locks: BTreeMap<String, ComponentLock>,
    #[serde(default)]
    pub conflicts: Vec<LockConflict>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub user_id: String,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub project_id: String,
    pub protocol_version: String,
}

/// Full-sync request. `pending_operations` lets the server avoid clobbering
/// fresh local writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub pending_operations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionBroadcast {
    pub conflict_id: String,
    pub resolution: ResolutionStrategy,
    #[serde(default)]
    pub resolved_data: Value,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

// ── Typed messages ──────────────────────────────────────────────────

/// Messages the server pushes to a subscribed client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    LockUpdate(LockUpdate),
    BulkLockUpdate(BulkLockNotice),
    Conflict(LockConflict),
    ConflictResolved(ConflictResolvedNotice),
    SyncResponse(SyncSnapshot),
    Presence(PresenceUpdate),
    PermissionChange(Value),
}

impl ServerMessage {
    /// Decode an inbound envelope addressed to `project_id`.
    pub fn decode(envelope: &Envelope, project_id: &str) -> Result<Self, ProtocolError> {
        let (channel, project) = split_address(&envelope.channel)?;
        if project != project_id {
            return Err(ProtocolError::ProjectMismatch {
                expected: project_id.to_string(),
                actual: project.to_string(),
            });
        }

        let data = &envelope.data;
        match channel {
            Channel::Locks => {
                if data.get("bulk_update").and_then(Value::as_bool) == Some(true) {
                    decode_payload(envelope).map(Self::BulkLockUpdate)
                } else {
                    decode_payload(envelope).map(Self::LockUpdate)
                }
            }
            Channel::Conflicts => {
                if data.get("status").and_then(Value::as_str) == Some("resolved") {
                    decode_payload(envelope).map(Self::ConflictResolved)
                } else {
                    decode_payload(envelope).map(Self::Conflict)
                }
            }
            Channel::ConflictResolutions => decode_payload(envelope).map(Self::ConflictResolved),
            Channel::SyncResponse => decode_payload(envelope).map(Self::SyncResponse),
            Channel::Presence => decode_payload(envelope).map(Self::Presence),
            Channel::Permissions => Ok(Self::PermissionChange(data.clone())),
            outbound => Err(ProtocolError::WrongDirection(outbound.prefix().to_string())),
        }
    }
}

/// Messages a client sends on the project connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe,
    SyncRequest(SyncRequest),
    LockUpdate(LockUpdate),
    ConflictResolution(ConflictResolutionBroadcast),
}

impl ClientMessage {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Subscribe => Channel::Subscribe,
            Self::SyncRequest(_) => Channel::SyncRequest,
            Self::LockUpdate(_) => Channel::LockUpdate,
            Self::ConflictResolution(_) => Channel::ConflictResolution,
        }
    }

    pub fn encode(&self, project_id: &str) -> Result<Envelope, ProtocolError> {
        let channel = self.channel();
        let data = match self {
            Self::Subscribe => serde_json::to_value(SubscribeRequest {
                project_id: project_id.to_string(),
                protocol_version: CURRENT_PROTOCOL_VERSION.to_string(),
            }),
            Self::SyncRequest(request) => serde_json::to_value(request),
            Self::LockUpdate(update) => serde_json::to_value(update),
            Self::ConflictResolution(resolution) => serde_json::to_value(resolution),
        }
        .map_err(|source| ProtocolError::InvalidPayload {
            channel: channel.address(project_id),
            source,
        })?;
        Ok(Envelope::new(channel, project_id, data))
    }
}

fn decode_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ProtocolError> {
    serde_json::from_value(envelope.data.clone()).map_err(|source| ProtocolError::InvalidPayload {
        channel: envelope.channel.clone(),
        source,
    })
}
