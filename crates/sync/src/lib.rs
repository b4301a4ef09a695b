// folio-sync library entry point: collaborative component locking with
// optimistic updates, realtime sync, and an offline queue.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod outbox;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use channel::{ChannelEvent, ConnectionState, RealtimeChannel};
pub use config::SyncConfig;
pub use coordinator::{LockMutation, OperationType, OptimisticCoordinator, OptimisticOperation};
pub use error::SyncError;
pub use outbox::{ConnectivityIndicator, DrainReport, OfflineQueue};
pub use registry::{LockRegistry, PreflightConflict};
pub use resolver::{ConflictResolver, Resolution, ResolvedConflict};
pub use runtime::{spawn_session, SessionHandle};
pub use session::LockSession;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{ChannelTransport, LockApi, ResolutionApi, SyncApi, Transports};
