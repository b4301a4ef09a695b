// Session runtime: drives a `LockSession` on a tokio task.
//
// The session itself never sleeps. This task owns it, feeds it commands from
// `SessionHandle`, and wakes at the session's next timer deadline to call
// `advance`. Wall-clock time is an anchor plus tokio's monotonic clock, so
// paused-time tests move the session's clock too.

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use folio_common::protocol::api::LockResponse;
use folio_common::protocol::channel::Envelope;
use folio_common::types::{BulkLockOperation, LockLevel};

use crate::channel::ChannelEvent;
use crate::error::SyncError;
use crate::outbox::DrainReport;
use crate::resolver::{Resolution, ResolvedConflict};
use crate::session::LockSession;
use crate::store::KeyValueStore;

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

type Call<S> = Box<dyn FnOnce(&mut LockSession<S>, DateTime<Utc>) + Send>;

/// Maps tokio's monotonic clock onto wall-clock time.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    wall: DateTime<Utc>,
    start: Instant,
}

impl SessionClock {
    fn starting_at(wall: DateTime<Utc>) -> Self {
        Self { wall, start: Instant::now() }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    fn until(&self, deadline: DateTime<Utc>) -> std::time::Duration {
        (deadline - self.now()).to_std().unwrap_or_default()
    }
}

pub struct SessionHandle<S: KeyValueStore> {
    commands: mpsc::Sender<Call<S>>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<LockSession<S>>>,
}

/// Start driving `session` on the current tokio runtime. `now` must be the
/// timestamp the session was opened with.
pub fn spawn_session<S>(session: LockSession<S>, now: DateTime<Utc>) -> SessionHandle<S>
where
    S: KeyValueStore + Send + 'static,
{
    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
    let clock = SessionClock::starting_at(now);

    info!(project_id = %session.project_id(), "lock session runtime started");
    let task = tokio::spawn(run_session(session, clock, command_rx, events.clone(), shutdown_rx));
    SessionHandle { commands, events, shutdown_tx, task: Some(task) }
}

async fn run_session<S: KeyValueStore>(
    mut session: LockSession<S>,
    clock: SessionClock,
    mut commands: mpsc::Receiver<Call<S>>,
    events: broadcast::Sender<ChannelEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> LockSession<S> {
    loop {
        let wake = session.next_deadline().map(|deadline| clock.until(deadline));
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            command = commands.recv() => match command {
                Some(call) => call(&mut session, clock.now()),
                None => break,
            },
            () = sleep_for(wake) => {
                for event in session.advance(clock.now()) {
                    debug!(?event, "timer event");
                    // No subscribers is fine.
                    let _ = events.send(event);
                }
            }
        }
    }

    session.close();
    info!(project_id = %session.project_id(), "lock session runtime stopped");
    session
}

fn sleep_for(wake: Option<std::time::Duration>) -> impl Future<Output = ()> {
    async move {
        match wake {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }
}

impl<S: KeyValueStore + Send + 'static> SessionHandle<S> {
    /// Run `f` on the session task with the current time.
    pub async fn call<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce(&mut LockSession<S>, DateTime<Utc>) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let call: Call<S> = Box::new(move |session, now| {
            let _ = reply_tx.send(f(session, now));
        });
        self.commands.send(call).await.map_err(|_| SyncError::Closed)?;
        reply_rx.await.map_err(|_| SyncError::Closed)
    }

    /// Read session state without mutating it.
    pub async fn query<R, F>(&self, f: F) -> Result<R, SyncError>
    where
        R: Send + 'static,
        F: FnOnce(&LockSession<S>) -> R + Send + 'static,
    {
        self.call(move |session, _| f(session)).await
    }

    /// Events produced by timers (reconnects, periodic syncs, timeouts).
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn connect(&self) -> Result<ChannelEvent, SyncError> {
        self.call(|session, now| session.connect(now)).await?
    }

    pub async fn lock_component(
        &self,
        component_id: impl Into<String>,
        level: LockLevel,
        reason: impl Into<String>,
    ) -> Result<Uuid, SyncError> {
        let (component_id, reason) = (component_id.into(), reason.into());
        self.call(move |session, now| session.lock_component(&component_id, level, &reason, now))
            .await?
    }

    pub async fn unlock_component(&self, component_id: impl Into<String>) -> Result<Uuid, SyncError> {
        let component_id = component_id.into();
        self.call(move |session, now| session.unlock_component(&component_id, now)).await?
    }

    pub async fn bulk_update(&self, operations: Vec<BulkLockOperation>) -> Result<Uuid, SyncError> {
        self.call(move |session, now| session.bulk_update(operations, now)).await?
    }

    pub async fn handle_lock_response(
        &self,
        operation_id: Uuid,
        response: LockResponse,
    ) -> Result<(), SyncError> {
        self.call(move |session, now| session.handle_lock_response(operation_id, response, now))
            .await?
    }

    pub async fn handle_channel_message(&self, envelope: Envelope) -> Result<ChannelEvent, SyncError> {
        self.call(move |session, now| session.handle_channel_message(&envelope, now)).await?
    }

    pub async fn handle_disconnect(&self, reason: impl Into<String>) -> Result<ChannelEvent, SyncError> {
        let reason = reason.into();
        self.call(move |session, now| session.handle_disconnect(&reason, now)).await
    }

    pub async fn set_online(&self, online: bool) -> Result<Option<DrainReport>, SyncError> {
        self.call(move |session, now| session.set_online(online, now)).await?
    }

    pub async fn set_visibility(&self, visible: bool) -> Result<Option<ChannelEvent>, SyncError> {
        self.call(move |session, now| session.set_visibility(visible, now)).await
    }

    pub async fn drain_offline_queue(&self) -> Result<DrainReport, SyncError> {
        self.call(|session, now| session.drain_offline_queue(now)).await?
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: impl Into<String>,
        resolution: Resolution,
    ) -> Result<ResolvedConflict, SyncError> {
        let conflict_id = conflict_id.into();
        self.call(move |session, now| session.resolve_conflict(&conflict_id, resolution, now))
            .await?
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Stop the runtime and take the closed session back.
    pub async fn wait(mut self) -> Option<LockSession<S>> {
        self.shutdown();
        let task = self.task.take()?;
        match task.await {
            Ok(session) => Some(session),
            Err(error) => {
                warn!(?error, "lock session runtime terminated unexpectedly");
                None
            }
        }
    }
}

impl<S: KeyValueStore> Drop for SessionHandle<S> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
