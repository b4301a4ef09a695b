// Request/response shapes for the lock, sync, and conflict-resolution endpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    BulkLockOperation, ComponentLock, ErrorKind, OfflineChange, ResolutionStrategy,
};

pub const HTTP_CONFLICT: u16 = 409;

/// `PUT /api/projects/{projectId}/locks/{componentId}` (null lock = unlock).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockUpdateRequest {
    pub project_id: String,
    pub component_id: String,
    pub lock: Option<ComponentLock>,
}

/// `POST /api/projects/{projectId}/locks/bulk`, applied atomically server-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BulkLockRequest {
    pub project_id: String,
    pub operations: Vec<BulkLockOperation>,
}

impl BulkLockRequest {
    /// Every component id touched by the request, in first-seen order.
    pub fn component_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.operations.iter().flat_map(|op| op.component_ids.iter()) {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }
}

/// Outcome of a lock mutation request.
#[derive(Debug, Clone, PartialEq)]
pub enum LockResponse {
    Confirmed,
    Rejected { kind: ErrorKind, message: String },
    /// 409: the listed components diverge from the server. Components of the
    /// request that are not listed were accepted.
    Conflict { remote: BTreeMap<String, Option<ComponentLock>> },
}

impl LockResponse {
    pub fn rejected(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Rejected { kind, message: message.into() }
    }

    /// Map an HTTP status to the error kind the client records.
    pub fn error_kind_for_status(status: u16) -> ErrorKind {
        match status {
            400 | 422 => ErrorKind::Validation,
            401 | 403 => ErrorKind::Permission,
            HTTP_CONFLICT => ErrorKind::Conflict,
            _ => ErrorKind::Network,
        }
    }
}

/// `POST /api/sync/{entity}` for one replayed offline change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncChangeRequest {
    pub change: OfflineChange,
    pub client_timestamp: DateTime<Utc>,
}

impl SyncChangeRequest {
    pub fn endpoint(&self) -> String {
        format!("/api/sync/{}", self.change.entity.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncResponse {
    Synced,
    /// 409 with the server's current state for the entity.
    Conflict { server_state: Value },
    Failed { status: u16, message: String },
}

/// `POST /api/sync/conflicts/{changeId}/resolve`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionRequest {
    pub change_id: String,
    pub resolution_strategy: ResolutionStrategy,
    pub resolved_data: Value,
}
