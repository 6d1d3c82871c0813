use std::sync::Arc;

use serde_json::json;

use crate::connector::{LogEntry, LogLevel, QueryCondition, RowStore, SyncLogger};
use crate::error::SyncError;
use crate::model::{
    ChangeOperation, PROPERTY_CONTEXT, PROPERTY_IS_LOCAL_SNAPSHOT, SyncChange, SyncSnapshot,
    random_id, timestamp_now,
};

const LOG_SOURCE: &str = "localState";

/// Bookkeeping for the single pending local snapshot per entity context: the
/// transient, unpublished log of this node's mutations. The pending snapshot
/// either holds at least one change or does not exist.
pub struct LocalState {
    snapshot_store: Arc<dyn RowStore<SyncSnapshot>>,
    context: String,
    logger: Arc<dyn SyncLogger>,
}

impl LocalState {
    pub fn new(
        snapshot_store: Arc<dyn RowStore<SyncSnapshot>>,
        context: impl Into<String>,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            snapshot_store,
            context: context.into(),
            logger,
        }
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Record one local mutation into the pending snapshot, creating the
    /// snapshot lazily. At most one change is kept per primary key: a new
    /// change for the same key supersedes the previous one, so a delete
    /// always replaces a prior pending set.
    pub async fn record_change(
        &self,
        operation: ChangeOperation,
        id: &str,
    ) -> Result<(), SyncError> {
        let mut snapshot = match self.load_pending().await? {
            Some(snapshot) => snapshot,
            None => SyncSnapshot {
                id: random_id(),
                date_created: timestamp_now(),
                date_modified: None,
                change_set_storage_ids: None,
                changes: Some(Vec::new()),
                is_local_snapshot: Some(true),
                context: Some(self.context.clone()),
            },
        };

        let changes = snapshot.changes.get_or_insert_with(Vec::new);
        changes.retain(|change| change.id.as_deref() != Some(id));
        changes.push(SyncChange {
            operation,
            id: Some(id.to_string()),
            entity: None,
        });
        if !changes.is_empty() {
            snapshot.date_modified = Some(timestamp_now());
        }

        self.logger.log(
            LogEntry::new(LogLevel::Debug, LOG_SOURCE, "localChangeRecorded").data(json!({
                "operation": operation.as_str(),
                "id": id,
                "snapshotId": snapshot.id,
            })),
        );

        self.snapshot_store.set(snapshot, None).await
    }

    /// The pending snapshot for this context, if one exists.
    pub async fn load_pending(&self) -> Result<Option<SyncSnapshot>, SyncError> {
        let condition = QueryCondition::all(vec![
            QueryCondition::equals(PROPERTY_IS_LOCAL_SNAPSHOT, json!(true)),
            QueryCondition::equals(PROPERTY_CONTEXT, json!(self.context)),
        ]);
        let page = self
            .snapshot_store
            .query(Some(&condition), None, None, None, Some(1))
            .await?;
        Ok(page.entities.into_iter().next())
    }

    /// Drop a pending snapshot after a successful publish or consolidation.
    pub async fn discard_pending(&self, snapshot_id: &str) -> Result<(), SyncError> {
        self.snapshot_store.remove(snapshot_id, None).await
    }

    /// Claim the pending snapshot: load it and delete its row in one step.
    /// The caller serialises this against `record_change`, so a mutation
    /// arriving while the claimed snapshot is being published finds no
    /// pending row and synthesizes a fresh one instead of appending to the
    /// snapshot in flight.
    pub async fn take_pending(&self) -> Result<Option<SyncSnapshot>, SyncError> {
        let pending = self.load_pending().await?;
        if let Some(snapshot) = &pending {
            self.snapshot_store.remove(&snapshot.id, None).await?;
        }
        Ok(pending)
    }

    /// Put a claimed snapshot back after a failed publish or consolidation.
    /// If mutations opened a newer pending snapshot in the meantime, the
    /// restored changes are folded in ahead of the newer ones, keeping a
    /// single pending snapshot where the newest change per primary key wins.
    pub async fn replace_pending(&self, snapshot: SyncSnapshot) -> Result<(), SyncError> {
        let Some(mut current) = self.load_pending().await? else {
            return self.snapshot_store.set(snapshot, None).await;
        };

        let newer = current.changes.take().unwrap_or_default();
        let mut changes = snapshot.changes.unwrap_or_default();
        changes.retain(|change| !newer.iter().any(|n| n.id == change.id));
        changes.extend(newer);
        if !changes.is_empty() {
            current.date_modified = Some(timestamp_now());
        }
        current.changes = Some(changes);
        self.snapshot_store.set(current, None).await
    }

    /// Upsert the local mirror row for a remote snapshot. Mirror rows carry
    /// this context but are not pending snapshots; they are never deleted.
    pub async fn upsert_mirror(&self, remote: &SyncSnapshot) -> Result<(), SyncError> {
        let mirror = SyncSnapshot {
            id: remote.id.clone(),
            date_created: remote.date_created.clone(),
            date_modified: remote.date_modified.clone(),
            change_set_storage_ids: remote.change_set_storage_ids.clone(),
            changes: None,
            is_local_snapshot: None,
            context: Some(self.context.clone()),
        };
        self.snapshot_store.set(mirror, None).await
    }

    /// The mirror row for a remote snapshot id, if it was observed before.
    pub async fn load_mirror(&self, snapshot_id: &str) -> Result<Option<SyncSnapshot>, SyncError> {
        self.snapshot_store.get(snapshot_id, None, None).await
    }
}
