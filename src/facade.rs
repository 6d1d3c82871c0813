use std::sync::{Arc, RwLock};

use crate::connector::{
    EqualityCondition, QueryCondition, QueryPage, RowStore, SortProperty,
};
use crate::entity::SyncEntity;
use crate::error::SyncError;
use crate::local_state::LocalState;
use crate::model::{ChangeOperation, timestamp_now};

/// The storage contract of a synchronised node: reads pass straight through
/// to the row store, writes additionally feed the sync engine's pending
/// change log. Obtained from [`Syncer::store`](crate::syncer::Syncer::store);
/// cheap to clone.
pub struct SyncedStore<T: SyncEntity> {
    entity_store: Arc<dyn RowStore<T>>,
    local_state: Arc<LocalState>,
    node_identity: Arc<RwLock<Option<String>>>,
    pending_claim: Arc<tokio::sync::Mutex<()>>,
}

impl<T: SyncEntity> Clone for SyncedStore<T> {
    fn clone(&self) -> Self {
        Self {
            entity_store: self.entity_store.clone(),
            local_state: self.local_state.clone(),
            node_identity: self.node_identity.clone(),
            pending_claim: self.pending_claim.clone(),
        }
    }
}

impl<T: SyncEntity> SyncedStore<T> {
    pub(crate) fn new(
        entity_store: Arc<dyn RowStore<T>>,
        local_state: Arc<LocalState>,
        node_identity: Arc<RwLock<Option<String>>>,
        pending_claim: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        Self {
            entity_store,
            local_state,
            node_identity,
            pending_claim,
        }
    }

    fn require_node_identity(&self) -> Result<String, SyncError> {
        self.node_identity
            .read()
            .expect("node identity lock")
            .clone()
            .ok_or(SyncError::State("node identity not set, engine not started"))
    }

    /// Pure pass-through; never touches sync state.
    pub async fn get(
        &self,
        id: &str,
        secondary_index: Option<&str>,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<Option<T>, SyncError> {
        self.entity_store.get(id, secondary_index, conditions).await
    }

    /// Pure pass-through; never touches sync state.
    pub async fn query(
        &self,
        condition: Option<&QueryCondition>,
        sort: Option<&[SortProperty]>,
        properties: Option<&[String]>,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<QueryPage<T>, SyncError> {
        self.entity_store
            .query(condition, sort, properties, cursor, page_size)
            .await
    }

    /// Stamp the reserved fields, validate, write the row and record the
    /// pending change. A row-store rejection propagates unchanged and no
    /// local change is recorded.
    pub async fn set(
        &self,
        mut entity: T,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError> {
        let identity = self.require_node_identity()?;
        entity.set_node_identity(Some(identity));
        entity.set_date_created(timestamp_now());
        entity.validate()?;

        let primary_key = entity.primary_key();
        self.entity_store.set(entity, conditions).await?;

        let _claim = self.pending_claim.lock().await;
        self.local_state
            .record_change(ChangeOperation::Set, &primary_key)
            .await
    }

    /// Delete the row and record the pending change; a pending set for the
    /// same key is superseded by the delete.
    pub async fn remove(
        &self,
        id: &str,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError> {
        self.entity_store.remove(id, conditions).await?;

        let _claim = self.pending_claim.lock().await;
        self.local_state
            .record_change(ChangeOperation::Delete, id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NoopLogger;
    use crate::memory::MemoryRowStore;
    use crate::model::{SyncChange, SyncSnapshot};
    use crate::test_support::TestItem;
    use serde_json::json;

    const NODE: &str = "did:example:facade";

    fn synced_store() -> (SyncedStore<TestItem>, Arc<MemoryRowStore<TestItem>>, Arc<LocalState>) {
        let entity_store = Arc::new(MemoryRowStore::<TestItem>::new());
        let local_state = Arc::new(LocalState::new(
            Arc::new(MemoryRowStore::<SyncSnapshot>::new()),
            "items",
            Arc::new(NoopLogger),
        ));
        let store = SyncedStore::new(
            entity_store.clone(),
            local_state.clone(),
            Arc::new(RwLock::new(Some(NODE.to_string()))),
            Arc::new(tokio::sync::Mutex::new(())),
        );
        (store, entity_store, local_state)
    }

    #[tokio::test]
    async fn set_stamps_reserved_fields_and_records_change() {
        let (store, entity_store, local_state) = synced_store();
        let mut item = TestItem::stripped("111", "a", "b");
        item.date_created = "1970-01-01T00:00:00.000Z".to_string();

        store.set(item, None).await.unwrap();

        let row = entity_store.get("111", None, None).await.unwrap().unwrap();
        assert_eq!(row.node_identity.as_deref(), Some(NODE));
        assert_ne!(row.date_created, "1970-01-01T00:00:00.000Z");

        let pending = local_state.load_pending().await.unwrap().unwrap();
        assert_eq!(pending.changes.unwrap(), vec![SyncChange::set("111")]);
    }

    #[tokio::test]
    async fn rejected_write_records_no_change() {
        let (store, _, local_state) = synced_store();
        store.set(TestItem::new("111", "a", "b"), None).await.unwrap();
        let before = local_state.load_pending().await.unwrap().unwrap();

        let guard = [EqualityCondition::new("value1", json!("nope"))];
        let err = store
            .set(TestItem::new("111", "c", "d"), Some(&guard))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));

        let after = local_state.load_pending().await.unwrap().unwrap();
        assert_eq!(before.changes, after.changes);
    }

    #[tokio::test]
    async fn remove_supersedes_pending_set() {
        let (store, entity_store, local_state) = synced_store();
        store.set(TestItem::new("111", "a", "b"), None).await.unwrap();
        store.remove("111", None).await.unwrap();

        assert!(entity_store.get("111", None, None).await.unwrap().is_none());
        let pending = local_state.load_pending().await.unwrap().unwrap();
        assert_eq!(pending.changes.unwrap(), vec![SyncChange::delete("111")]);
    }

    #[tokio::test]
    async fn mutations_require_a_started_engine() {
        let (store, _, _) = synced_store();
        let unstarted = SyncedStore {
            node_identity: Arc::new(RwLock::new(None)),
            ..store
        };
        let err = unstarted
            .set(TestItem::new("1", "a", "b"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::State(_)));
    }

    #[tokio::test]
    async fn reads_never_touch_sync_state() {
        let (store, entity_store, local_state) = synced_store();
        entity_store
            .set(TestItem::new("111", "a", "b"), None)
            .await
            .unwrap();

        assert!(store.get("111", None, None).await.unwrap().is_some());
        let page = store.query(None, None, None, None, None).await.unwrap();
        assert_eq!(page.entities.len(), 1);
        assert!(local_state.load_pending().await.unwrap().is_none());
    }
}
