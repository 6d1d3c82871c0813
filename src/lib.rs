//! Decentralised entity-storage synchroniser.
//!
//! Keeps a node's key/value entity store eventually consistent with a shared,
//! publicly-readable log of signed changesets distributed across independent
//! nodes. Each node owns the rows it creates, republishes its own changes and
//! applies the union of everything it observes.

pub mod changesets;
pub mod codec;
pub mod connector;
pub mod entity;
pub mod error;
pub mod facade;
pub mod local_state;
pub mod memory;
pub mod model;
pub mod reconciler;
pub mod remote_state;
pub mod syncer;

#[cfg(test)]
pub(crate) mod test_support;

pub use changesets::ChangeSets;
pub use connector::{
    BlobStore, Comparison, EqualityCondition, IdentityConnector, LogEntry, LogLevel,
    LogicOperator, NoopLogger, PointerStore, PropertyCondition, QueryCondition, QueryPage,
    RowStore, SortDirection, SortProperty, SyncLogger, TracingLogger, TrustedPeer,
};
pub use entity::{StorageEntity, SyncEntity};
pub use error::SyncError;
pub use facade::SyncedStore;
pub use local_state::LocalState;
pub use model::{
    ChangeOperation, ChangeSet, DataIntegrityProof, SyncChange, SyncPointer, SyncSnapshot,
    SyncState,
};
pub use reconciler::Reconciler;
pub use remote_state::RemoteState;
pub use syncer::{SyncConnectors, SyncOptions, Syncer};
