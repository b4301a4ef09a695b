use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::json;

use folio_common::protocol::api::{SyncChangeRequest, SyncResponse};
use folio_common::protocol::channel::{Channel, Envelope, SyncSnapshot};
use folio_common::types::{
    BulkLockOperation, ChangeType, ComponentLock, EntityKind, ErrorKind, LockConflict, LockLevel,
    LockType, OfflineChange,
};
use folio_sync::config::{ReconnectConfig, TimeoutConfig};
use folio_sync::coordinator::{Dispatch, LockMutation, OptimisticCoordinator};
use folio_sync::outbox::OfflineQueue;
use folio_sync::registry::LockRegistry;
use folio_sync::store::MemoryStore;
use folio_sync::transport::{ChannelTransport, SyncApi};
use folio_sync::RealtimeChannel;

const PROJECT: &str = "novel-42";
const COMPONENTS: [&str; 5] = ["scene-1", "scene-2", "scene-3", "chapter-1", "character-1"];

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().expect("valid timestamp")
}

// ── Strategies ──────────────────────────────────────────────────────

fn level() -> impl Strategy<Value = LockLevel> {
    prop_oneof![Just(LockLevel::Soft), Just(LockLevel::Hard), Just(LockLevel::Frozen)]
}

fn component() -> impl Strategy<Value = &'static str> {
    prop::sample::select(COMPONENTS.to_vec())
}

fn lock_state() -> impl Strategy<Value = BTreeMap<String, ComponentLock>> {
    prop::collection::vec(prop::option::of(level()), COMPONENTS.len()).prop_map(|levels| {
        COMPONENTS
            .iter()
            .zip(levels)
            .filter_map(|(id, level)| {
                let lock = ComponentLock::new(*id, level?, LockType::Editorial, "Review", "bob", t0());
                Some((id.to_string(), lock))
            })
            .collect()
    })
}

fn mutation() -> impl Strategy<Value = LockMutation> {
    let lock = (component(), level()).prop_map(|(id, level)| LockMutation::Lock {
        component_id: id.to_string(),
        lock: ComponentLock::new(id, level, LockType::Personal, "Edit", "alice", t0()),
    });
    let unlock =
        component().prop_map(|id| LockMutation::Unlock { component_id: id.to_string() });
    let bulk_op = prop_oneof![
        (prop::collection::vec(component(), 1..4), level())
            .prop_map(|(ids, level)| BulkLockOperation::lock(ids, level, "Bulk")),
        prop::collection::vec(component(), 1..4).prop_map(|ids| BulkLockOperation::unlock(ids, "Bulk")),
        (prop::collection::vec(component(), 1..4), level())
            .prop_map(|(ids, level)| BulkLockOperation::change_level(ids, level, "Bulk")),
    ];
    let bulk = prop::collection::vec(bulk_op, 1..4)
        .prop_map(|operations| LockMutation::Bulk { operations });
    prop_oneof![lock, unlock, bulk]
}

// ── Mocks ───────────────────────────────────────────────────────────

struct NullTransport;

impl ChannelTransport for NullTransport {
    fn connect(&mut self, _project_id: &str) -> Result<()> {
        Ok(())
    }

    fn send(&mut self, _envelope: &Envelope) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

#[derive(Default)]
struct ReplayLog {
    ids: Vec<String>,
}

impl SyncApi for ReplayLog {
    fn sync_change(&mut self, request: &SyncChangeRequest) -> Result<SyncResponse> {
        self.ids.push(request.change.id.clone());
        Ok(SyncResponse::Synced)
    }
}

// ── Properties ──────────────────────────────────────────────────────

proptest! {
    #[test]
    fn rolling_back_every_operation_restores_initial_state(
        initial in lock_state(),
        mutations in prop::collection::vec(mutation(), 1..6),
    ) {
        let mut registry = LockRegistry::new();
        registry.set_all(initial.clone(), t0());
        let mut coordinator = OptimisticCoordinator::new();

        let mut ids = Vec::new();
        for (step, mutation) in mutations.into_iter().enumerate() {
            let now = t0() + Duration::seconds(step as i64 + 1);
            let id = coordinator
                .apply_and_send(mutation, &mut registry, "alice", now, |_, _| Ok(Dispatch::Sent))
                .expect("dispatch should succeed");
            ids.push(id);
        }

        for id in ids.into_iter().rev() {
            coordinator.rollback(id, &mut registry, ErrorKind::Network, "timed out", t0() + Duration::minutes(1));
        }

        prop_assert_eq!(registry.locks(), &initial);
        prop_assert!(coordinator.is_empty());
        prop_assert!(COMPONENTS.iter().all(|id| !registry.is_loading(id)));
    }

    #[test]
    fn confirming_keeps_the_optimistic_state(
        initial in lock_state(),
        mutation in mutation(),
    ) {
        let mut registry = LockRegistry::new();
        registry.set_all(initial, t0());
        let mut coordinator = OptimisticCoordinator::new();

        let id = coordinator
            .apply_and_send(mutation, &mut registry, "alice", t0(), |_, _| Ok(Dispatch::Sent))
            .expect("dispatch should succeed");
        let applied = registry.locks().clone();
        coordinator.confirm(id, &mut registry);

        prop_assert_eq!(registry.locks(), &applied);
        prop_assert!(!registry.has_errors());
    }

    #[test]
    fn full_sync_is_idempotent(
        initial in lock_state(),
        server in lock_state(),
        conflicted in prop::collection::vec(component(), 0..3),
    ) {
        let mut registry = LockRegistry::new();
        registry.set_all(initial, t0());
        let coordinator = OptimisticCoordinator::new();
        let mut channel = RealtimeChannel::new(
            PROJECT,
            NullTransport,
            TimeoutConfig::default(),
            ReconnectConfig::default(),
        );
        channel.connect(&mut registry, 0, t0()).expect("connect should succeed");

        let conflicts: Vec<LockConflict> = conflicted
            .iter()
            .map(|id| LockConflict::lock_divergence(*id, None, server.get(*id), t0()))
            .collect();
        let snapshot = SyncSnapshot { locks: server.clone(), conflicts, timestamp: t0() };
        let envelope = Envelope::new(
            Channel::SyncResponse,
            PROJECT,
            serde_json::to_value(&snapshot).expect("snapshot serializes"),
        );

        channel
            .handle_message(&envelope, &mut registry, &coordinator, t0() + Duration::seconds(1))
            .expect("first sync applies");
        let once = (registry.locks().clone(), registry.conflicts().to_vec());
        channel
            .handle_message(&envelope, &mut registry, &coordinator, t0() + Duration::seconds(2))
            .expect("second sync applies");

        prop_assert_eq!(registry.locks(), &server);
        prop_assert_eq!((registry.locks().clone(), registry.conflicts().to_vec()), once);
        prop_assert!(!registry.is_globally_loading());
    }

    #[test]
    fn offline_queue_replays_in_timestamp_then_enqueue_order(
        offsets in prop::collection::vec(0i64..5, 1..12),
    ) {
        let mut queue = OfflineQueue::load(MemoryStore::new(), PROJECT, false).expect("queue loads");
        let mut registry = LockRegistry::new();

        let mut enqueued = Vec::new();
        for (index, offset) in offsets.iter().enumerate() {
            let change = OfflineChange::new(
                ChangeType::Update,
                EntityKind::Scene,
                json!({ "componentId": format!("scene-{index}") }),
                t0() + Duration::seconds(*offset),
            );
            let id = queue.enqueue(change).expect("enqueue persists");
            enqueued.push((*offset, id));
        }
        // Stable sort keeps enqueue order within a timestamp.
        enqueued.sort_by_key(|(offset, _)| *offset);
        let expected: Vec<String> = enqueued.into_iter().map(|(_, id)| id).collect();

        let mut api = ReplayLog::default();
        let report = queue
            .set_online(true, &mut api, &mut registry, t0() + Duration::minutes(1))
            .expect("drain runs")
            .expect("going online drains");

        prop_assert_eq!(&report.synced, &expected);
        prop_assert_eq!(api.ids, expected);
        prop_assert_eq!(queue.pending_count(), 0);
    }
}
