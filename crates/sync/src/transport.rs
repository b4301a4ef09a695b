// Transport seams for the lock server and the realtime connection.
//
// Concrete HTTP and WebSocket clients live in the host application. The
// session only sees these traits, so tests plug in recording mocks.

use anyhow::Result;
use uuid::Uuid;

use folio_common::protocol::api::{
    BulkLockRequest, ConflictResolutionRequest, LockUpdateRequest, SyncChangeRequest, SyncResponse,
};
use folio_common::protocol::channel::Envelope;

/// Lock mutation endpoints.
///
/// Requests are fire-and-forget: the host delivers the server's answer later
/// through `LockSession::handle_lock_response` using the same operation id.
/// An `Err` means the request never left the client and is rolled back at once.
pub trait LockApi {
    fn update_lock(&mut self, operation_id: Uuid, request: &LockUpdateRequest) -> Result<()>;
    fn bulk_update(&mut self, operation_id: Uuid, request: &BulkLockRequest) -> Result<()>;
}

/// Replay endpoint for offline changes. Blocking; called in queue order.
pub trait SyncApi {
    fn sync_change(&mut self, request: &SyncChangeRequest) -> Result<SyncResponse>;
}

pub trait ResolutionApi {
    fn submit_resolution(&mut self, request: &ConflictResolutionRequest) -> Result<()>;
}

/// Persistent realtime connection, one per project session.
pub trait ChannelTransport {
    fn connect(&mut self, project_id: &str) -> Result<()>;
    fn send(&mut self, envelope: &Envelope) -> Result<()>;
    fn close(&mut self);
}

impl<T: LockApi + ?Sized> LockApi for Box<T> {
    fn update_lock(&mut self, operation_id: Uuid, request: &LockUpdateRequest) -> Result<()> {
        (**self).update_lock(operation_id, request)
    }

    fn bulk_update(&mut self, operation_id: Uuid, request: &BulkLockRequest) -> Result<()> {
        (**self).bulk_update(operation_id, request)
    }
}

impl<T: SyncApi + ?Sized> SyncApi for Box<T> {
    fn sync_change(&mut self, request: &SyncChangeRequest) -> Result<SyncResponse> {
        (**self).sync_change(request)
    }
}

impl<T: ResolutionApi + ?Sized> ResolutionApi for Box<T> {
    fn submit_resolution(&mut self, request: &ConflictResolutionRequest) -> Result<()> {
        (**self).submit_resolution(request)
    }
}

impl<T: ChannelTransport + ?Sized> ChannelTransport for Box<T> {
    fn connect(&mut self, project_id: &str) -> Result<()> {
        (**self).connect(project_id)
    }

    fn send(&mut self, envelope: &Envelope) -> Result<()> {
        (**self).send(envelope)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// The full set of transports a session talks through.
pub struct Transports {
    pub locks: Box<dyn LockApi + Send>,
    pub sync: Box<dyn SyncApi + Send>,
    pub resolution: Box<dyn ResolutionApi + Send>,
    pub channel: Box<dyn ChannelTransport + Send>,
}
