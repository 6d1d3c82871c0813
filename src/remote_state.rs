use std::sync::Arc;

use serde_json::json;

use crate::changesets::ChangeSets;
use crate::codec;
use crate::connector::{
    BlobStore, LogEntry, LogLevel, PointerStore, RowStore, SortProperty, SyncLogger,
};
use crate::entity::SyncEntity;
use crate::error::SyncError;
use crate::model::{
    ChangeOperation, ChangeSet, PROPERTY_DATE_CREATED, SyncChange, SyncPointer, SyncSnapshot,
    SyncState, random_id, timestamp_now,
};

const LOG_SOURCE: &str = "remoteState";

/// Protocol against the blob store and the verifiable-pointer store: reads
/// and writes the sync-state blob and the pointer slot, publishes local
/// changesets and performs consolidation.
pub struct RemoteState<T: SyncEntity> {
    entity_store: Arc<dyn RowStore<T>>,
    blob_store: Arc<dyn BlobStore>,
    pointer_store: Arc<dyn PointerStore>,
    change_sets: Arc<ChangeSets<T>>,
    logger: Arc<dyn SyncLogger>,
}

impl<T: SyncEntity> RemoteState<T> {
    pub fn new(
        entity_store: Arc<dyn RowStore<T>>,
        blob_store: Arc<dyn BlobStore>,
        pointer_store: Arc<dyn PointerStore>,
        change_sets: Arc<ChangeSets<T>>,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            entity_store,
            blob_store,
            pointer_store,
            change_sets,
            logger,
        }
    }

    /// Read the sync pointer from its named slot; `Ok(None)` when the slot
    /// does not exist yet.
    pub async fn read_pointer(&self, key: &str) -> Result<Option<SyncPointer>, SyncError> {
        self.logger.log(
            LogEntry::new(LogLevel::Info, LOG_SOURCE, "verifiableSyncPointerRetrieving")
                .data(json!({ "key": key })),
        );
        let Some(bytes) = self.pointer_store.get(key).await? else {
            self.logger.log(
                LogEntry::new(LogLevel::Info, LOG_SOURCE, "verifiableSyncPointerNotFound")
                    .data(json!({ "key": key })),
            );
            return Ok(None);
        };
        let pointer = serde_json::from_slice(&bytes)?;
        Ok(Some(pointer))
    }

    /// Overwrite the pointer slot so it refers to `blob_id`. The slot's ACL
    /// allows only the authoring node; the engine assumes the caller is
    /// already authorised.
    pub async fn write_pointer(
        &self,
        key: &str,
        blob_id: &str,
        node_identity: &str,
    ) -> Result<(), SyncError> {
        let pointer = SyncPointer {
            sync_pointer_id: blob_id.to_string(),
        };
        let bytes = serde_json::to_vec(&pointer)?;
        let allow_list = [node_identity.to_string()];
        self.pointer_store.create(key, &bytes, &allow_list).await?;
        self.logger.log(
            LogEntry::new(LogLevel::Debug, LOG_SOURCE, "verifiableSyncPointerStored")
                .data(json!({ "key": key, "blobId": blob_id })),
        );
        Ok(())
    }

    /// Fetch and decode a sync-state blob; `Ok(None)` when the blob is gone.
    pub async fn read_sync_state(&self, blob_id: &str) -> Result<Option<SyncState>, SyncError> {
        let Some(bytes) = self.blob_store.get(blob_id).await? else {
            self.logger.log(
                LogEntry::new(LogLevel::Warn, LOG_SOURCE, "syncStateNotFound")
                    .data(json!({ "blobId": blob_id })),
            );
            return Ok(None);
        };
        let state = serde_json::from_slice(&codec::decompress(&bytes)?)?;
        Ok(Some(state))
    }

    /// Serialize, gzip and store a sync-state; returns the new blob id.
    /// Prior sync-state blobs are left in place for idempotent replay.
    pub async fn write_sync_state(&self, state: &SyncState) -> Result<String, SyncError> {
        let bytes = serde_json::to_vec(state)?;
        self.blob_store.set(&codec::compress(&bytes)?).await
    }

    /// Build, sign and store a changeset from pending changes. Every pending
    /// "set" is expanded by reading the full row; the embedded entity's
    /// `nodeIdentity` is stripped (the changeset carries it once at top
    /// level) and the primary key is dropped. Returns `None` when there is
    /// nothing to publish.
    pub async fn publish_change_set(
        &self,
        changes: &[SyncChange],
        node_identity: &str,
    ) -> Result<Option<String>, SyncError> {
        if changes.is_empty() {
            return Ok(None);
        }

        let mut expanded = Vec::with_capacity(changes.len());
        for change in changes {
            match (change.operation, &change.id) {
                (ChangeOperation::Set, Some(id)) => {
                    match self.entity_store.get(id, None, None).await? {
                        Some(mut entity) => {
                            entity.set_node_identity(None);
                            expanded.push(SyncChange::set_entity(serde_json::to_value(&entity)?));
                        }
                        None => {
                            // Row vanished since the change was recorded; the
                            // delete that removed it is its own change.
                            self.logger.log(
                                LogEntry::new(
                                    LogLevel::Debug,
                                    LOG_SOURCE,
                                    "changeSetEntityMissing",
                                )
                                .data(json!({ "id": id })),
                            );
                        }
                    }
                }
                _ => expanded.push(change.clone()),
            }
        }
        if expanded.is_empty() {
            return Ok(None);
        }

        let mut change_set = ChangeSet {
            id: random_id(),
            date_created: timestamp_now(),
            node_identity: node_identity.to_string(),
            changes: Some(expanded),
            entities: None,
            proof: None,
        };
        change_set.proof = Some(self.change_sets.sign(&change_set).await?);
        let blob_id = self.change_sets.store(&change_set).await?;
        Ok(Some(blob_id))
    }

    /// Trusted path: append a changeset blob id to the current snapshot of
    /// the shared sync-state (creating both when absent), store the new
    /// sync-state and move the pointer to it.
    pub async fn append_to_sync_state(
        &self,
        key: &str,
        node_identity: &str,
        change_set_blob_id: &str,
    ) -> Result<(), SyncError> {
        let mut state = match self.read_pointer(key).await? {
            Some(pointer) => self
                .read_sync_state(&pointer.sync_pointer_id)
                .await?
                .unwrap_or_default(),
            None => SyncState::default(),
        };

        state
            .snapshots
            .sort_by(|a, b| {
                (a.date_created.as_str(), a.id.as_str())
                    .cmp(&(b.date_created.as_str(), b.id.as_str()))
            });

        match state.snapshots.last_mut() {
            Some(current) => {
                current.date_modified = Some(timestamp_now());
                current
                    .change_set_storage_ids
                    .get_or_insert_with(Vec::new)
                    .push(change_set_blob_id.to_string());
            }
            None => {
                state.snapshots.push(SyncSnapshot {
                    id: random_id(),
                    date_created: timestamp_now(),
                    date_modified: None,
                    change_set_storage_ids: Some(vec![change_set_blob_id.to_string()]),
                    changes: None,
                    is_local_snapshot: None,
                    context: None,
                });
            }
        }

        let state_blob_id = self.write_sync_state(&state).await?;
        self.write_pointer(key, &state_blob_id, node_identity).await
    }

    /// Trusted path, periodic: page through every row ordered by
    /// `dateCreated` ascending, package each page as a signed consolidation
    /// changeset and publish a fresh sync-state whose single snapshot lists
    /// the produced blobs in order. A follower can replay it to derive the
    /// full dataset without the historical change log. An empty row store
    /// publishes nothing.
    pub async fn consolidate(
        &self,
        node_identity: &str,
        key: &str,
        batch_size: usize,
    ) -> Result<(), SyncError> {
        let sort = [SortProperty::ascending(PROPERTY_DATE_CREATED)];
        let mut cursor: Option<String> = None;
        let mut blob_ids = Vec::new();

        loop {
            let page = self
                .entity_store
                .query(None, Some(&sort), None, cursor.as_deref(), Some(batch_size))
                .await?;
            if !page.entities.is_empty() {
                let entities = page
                    .entities
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                let mut change_set = ChangeSet {
                    id: random_id(),
                    date_created: timestamp_now(),
                    node_identity: node_identity.to_string(),
                    changes: None,
                    entities: Some(entities),
                    proof: None,
                };
                change_set.proof = Some(self.change_sets.sign(&change_set).await?);
                blob_ids.push(self.change_sets.store(&change_set).await?);
            }
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if blob_ids.is_empty() {
            self.logger.log(LogEntry::new(
                LogLevel::Debug,
                LOG_SOURCE,
                "consolidationSkippedEmpty",
            ));
            return Ok(());
        }

        let change_set_count = blob_ids.len();
        let state = SyncState {
            snapshots: vec![SyncSnapshot {
                id: random_id(),
                date_created: timestamp_now(),
                date_modified: None,
                change_set_storage_ids: Some(blob_ids),
                changes: None,
                is_local_snapshot: None,
                context: None,
            }],
        };
        let state_blob_id = self.write_sync_state(&state).await?;
        self.write_pointer(key, &state_blob_id, node_identity)
            .await?;

        self.logger.log(
            LogEntry::new(LogLevel::Info, LOG_SOURCE, "consolidationCompleted").data(json!({
                "changeSets": change_set_count,
                "blobId": state_blob_id,
            })),
        );
        Ok(())
    }
}
