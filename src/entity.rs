use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SyncError;

/// Minimum contract for a row held in a [`RowStore`](crate::connector::RowStore):
/// serde-able and addressable by a schema-declared primary key.
pub trait StorageEntity:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    fn primary_key(&self) -> String;
}

/// An entity the engine synchronises. On top of [`StorageEntity`] it exposes
/// the two reserved fields the engine stamps and restores:
/// `nodeIdentity` (DID of the authoring node) and `dateCreated`.
/// Implement with accessors; no inheritance or base struct is required.
pub trait SyncEntity: StorageEntity {
    fn node_identity(&self) -> Option<&str>;

    /// `None` strips the field; a stripped identity is restored from the
    /// changeset top level when a remote row is applied.
    fn set_node_identity(&mut self, identity: Option<String>);

    fn set_date_created(&mut self, timestamp: String);

    /// Schema validation hook, invoked on every local mutation before the row
    /// store is written. Validation errors propagate to the caller and
    /// nothing is written.
    fn validate(&self) -> Result<(), SyncError> {
        Ok(())
    }
}
