use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use tempfile::tempdir;
use uuid::Uuid;

use folio_common::protocol::api::{
    BulkLockRequest, ConflictResolutionRequest, LockUpdateRequest, SyncChangeRequest, SyncResponse,
};
use folio_common::protocol::channel::Envelope;
use folio_common::types::{ChangeType, LockLevel, SyncStatus};
use folio_sync::config::SyncConfig;
use folio_sync::resolver::Resolution;
use folio_sync::session::LockSession;
use folio_sync::store::{KeyValueStore, SqliteStore};
use folio_sync::transport::{ChannelTransport, LockApi, ResolutionApi, SyncApi, Transports};

const PROJECT: &str = "novel-42";

#[derive(Clone, Default)]
struct RecordingServer {
    replayed: Arc<Mutex<Vec<SyncChangeRequest>>>,
    /// When set, every replayed change conflicts with this server state.
    conflict_with: Option<Value>,
}

impl LockApi for RecordingServer {
    fn update_lock(&mut self, _operation_id: Uuid, _request: &LockUpdateRequest) -> Result<()> {
        Ok(())
    }

    fn bulk_update(&mut self, _operation_id: Uuid, _request: &BulkLockRequest) -> Result<()> {
        Ok(())
    }
}

impl SyncApi for RecordingServer {
    fn sync_change(&mut self, request: &SyncChangeRequest) -> Result<SyncResponse> {
        self.replayed.lock().expect("replay log poisoned").push(request.clone());
        Ok(match &self.conflict_with {
            Some(server_state) => SyncResponse::Conflict { server_state: server_state.clone() },
            None => SyncResponse::Synced,
        })
    }
}

impl ResolutionApi for RecordingServer {
    fn submit_resolution(&mut self, _request: &ConflictResolutionRequest) -> Result<()> {
        Ok(())
    }
}

impl ChannelTransport for RecordingServer {
    fn connect(&mut self, _project_id: &str) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

impl RecordingServer {
    fn replay_count(&self) -> usize {
        self.replayed.lock().expect("replay log poisoned").len()
    }

    fn transports(&self) -> Transports {
        Transports {
            locks: Box::new(self.clone()),
            sync: Box::new(self.clone()),
            resolution: Box::new(self.clone()),
            channel: Box::new(self.clone()),
        }
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp")
}

fn config_with_storage(path: std::path::PathBuf) -> SyncConfig {
    SyncConfig { storage_path: Some(path), ..SyncConfig::default() }
}

#[test]
fn offline_changes_survive_restart_and_replay_once() {
    let tmp = tempdir().expect("tempdir should be created");
    let db_path = tmp.path().join("offline.db");
    let server = RecordingServer::default();

    {
        let mut session = LockSession::open_durable(
            config_with_storage(db_path.clone()),
            PROJECT,
            "alice",
            server.transports(),
            t0(),
        )
        .expect("session should open");
        session.set_online(false, t0()).expect("go offline");
        session
            .lock_component("scene-2", LockLevel::Soft, "Drafting", t0() + Duration::seconds(1))
            .expect("soft lock");
        session.unlock_component("scene-2", t0() + Duration::seconds(2)).expect("unlock");
        assert_eq!(session.queue().pending_count(), 2);
        session.close();
    }

    // Simulated restart: a fresh session over the same database file.
    let restarted = t0() + Duration::minutes(5);
    let mut session = LockSession::open_durable(
        config_with_storage(db_path.clone()),
        PROJECT,
        "alice",
        server.transports(),
        restarted,
    )
    .expect("session should reopen");

    let restored: Vec<ChangeType> =
        session.queue().changes().iter().map(|change| change.change_type).collect();
    assert_eq!(restored, vec![ChangeType::Create, ChangeType::Delete]);
    assert!(session.queue().changes().iter().all(|change| change.sync_status == SyncStatus::Pending));

    let report = session.drain_offline_queue(restarted).expect("drain should run");
    assert_eq!(report.synced.len(), 2);
    session.close();
    drop(session);

    let replayed = server.replayed.lock().expect("replay log poisoned").clone();
    assert_eq!(replayed.len(), 2);
    assert_eq!(replayed[0].change.change_type, ChangeType::Create);
    assert_eq!(replayed[0].endpoint(), "/api/sync/lock");

    let store = SqliteStore::open(&db_path).expect("database should reopen");
    assert!(store.keys().expect("keys should list").is_empty());
}

#[test]
fn conflict_recorded_before_restart_can_still_be_resolved() {
    let tmp = tempdir().expect("tempdir should be created");
    let db_path = tmp.path().join("offline.db");
    let server = RecordingServer {
        conflict_with: Some(json!({ "componentId": "scene-1", "lock": null })),
        ..RecordingServer::default()
    };

    let conflict_id = {
        let mut session = LockSession::open_durable(
            config_with_storage(db_path.clone()),
            PROJECT,
            "alice",
            server.transports(),
            t0(),
        )
        .expect("session should open");
        session.set_online(false, t0()).expect("go offline");
        session
            .lock_component("scene-1", LockLevel::Hard, "Revising", t0() + Duration::seconds(1))
            .expect("hard lock");
        let report = session
            .set_online(true, t0() + Duration::seconds(2))
            .expect("come back online")
            .expect("reconnect drains");
        assert_eq!(report.conflicts.len(), 1);
        let conflict_id = session.registry().conflicts()[0].id.clone();
        session.close();
        conflict_id
    };

    let restarted = t0() + Duration::minutes(5);
    let mut session = LockSession::open_durable(
        config_with_storage(db_path.clone()),
        PROJECT,
        "alice",
        server.transports(),
        restarted,
    )
    .expect("session should reopen");

    let queued_id = session.queue().conflicted().next().map(|change| change.id.clone());
    let conflicts = session.registry().conflicts();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].id, conflict_id);
    assert_eq!(conflicts[0].change_id, queued_id);

    // Conflicted changes are never replayed by a drain.
    let report = session.drain_offline_queue(restarted).expect("drain should run");
    assert!(report.synced.is_empty() && report.conflicts.is_empty());
    assert_eq!(server.replay_count(), 1);

    let resolved = session
        .resolve_conflict(&conflict_id, Resolution::Remote, restarted + Duration::seconds(1))
        .expect("conflict should resolve");
    assert_eq!(resolved.change_id, queued_id);
    assert!(session.registry().conflicts().is_empty());
    assert!(session.queue().changes().is_empty());
    assert_eq!(session.registry().lock_for_component("scene-1"), None);
    session.close();
    drop(session);

    let store = SqliteStore::open(&db_path).expect("database should reopen");
    assert!(store.keys().expect("keys should list").is_empty());
}

#[test]
fn projects_sharing_a_database_only_replay_their_own_changes() {
    let tmp = tempdir().expect("tempdir should be created");
    let db_path = tmp.path().join("offline.db");
    let server = RecordingServer::default();

    {
        let mut session = LockSession::open_durable(
            config_with_storage(db_path.clone()),
            "project-a",
            "alice",
            server.transports(),
            t0(),
        )
        .expect("project A should open");
        session.set_online(false, t0()).expect("go offline");
        session
            .lock_component("scene-1", LockLevel::Soft, "Drafting", t0() + Duration::seconds(1))
            .expect("soft lock");
        session.close();
    }

    let later = t0() + Duration::minutes(1);
    {
        let mut session = LockSession::open_durable(
            config_with_storage(db_path.clone()),
            "project-b",
            "bob",
            server.transports(),
            later,
        )
        .expect("project B should open");
        assert!(session.queue().changes().is_empty());
        let report = session.drain_offline_queue(later).expect("drain should run");
        assert!(report.synced.is_empty());
        session.close();
    }
    assert_eq!(server.replay_count(), 0);

    let mut session = LockSession::open_durable(
        config_with_storage(db_path.clone()),
        "project-a",
        "alice",
        server.transports(),
        later,
    )
    .expect("project A should reopen");
    assert_eq!(session.queue().pending_count(), 1);
    let report = session.drain_offline_queue(later).expect("drain should run");
    assert_eq!(report.synced.len(), 1);
    session.close();

    let replayed = server.replayed.lock().expect("replay log poisoned").clone();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].change.component_id(), Some("scene-1"));
}
