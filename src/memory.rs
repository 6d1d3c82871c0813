//! In-memory connector implementations.
//!
//! These back the test suite and are usable by hosts that want a local,
//! non-persistent store (offline development, embedding in examples). Rows
//! are held as JSON values so the stores stay schema-agnostic.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::connector::{
    BlobStore, Comparison, EqualityCondition, IdentityConnector, LogEntry, PointerStore,
    QueryCondition, QueryPage, RowStore, SortDirection, SortProperty, SyncLogger, TrustedPeer,
};
use crate::entity::StorageEntity;
use crate::error::SyncError;
use crate::model::{
    DataIntegrityProof, PROOF_CONTEXT, PROOF_CRYPTOSUITE, PROOF_PURPOSE, PROOF_TYPE, timestamp_now,
};

fn compare_values(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn matches_condition(row: &Value, condition: &QueryCondition) -> bool {
    match condition {
        QueryCondition::Property(prop) => {
            let actual = row.get(&prop.property);
            match prop.comparison {
                Comparison::Equals => actual == Some(&prop.value),
                Comparison::NotEquals => actual != Some(&prop.value),
                Comparison::GreaterThan => actual
                    .and_then(|a| compare_values(a, &prop.value))
                    .is_some_and(|o| o.is_gt()),
                Comparison::LessThan => actual
                    .and_then(|a| compare_values(a, &prop.value))
                    .is_some_and(|o| o.is_lt()),
            }
        }
        QueryCondition::Group { logic, conditions } => match logic {
            crate::connector::LogicOperator::And => {
                conditions.iter().all(|c| matches_condition(row, c))
            }
            crate::connector::LogicOperator::Or => {
                conditions.iter().any(|c| matches_condition(row, c))
            }
        },
    }
}

fn matches_equalities(row: &Value, conditions: &[EqualityCondition]) -> bool {
    conditions
        .iter()
        .all(|c| row.get(&c.property) == Some(&c.value))
}

/// Row store over an in-memory vector, insertion-ordered.
pub struct MemoryRowStore<T: StorageEntity> {
    rows: RwLock<Vec<(String, Value)>>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: StorageEntity> MemoryRowStore<T> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            _entity: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("rows lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: StorageEntity> Default for MemoryRowStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: StorageEntity> RowStore<T> for MemoryRowStore<T> {
    async fn get(
        &self,
        id: &str,
        secondary_index: Option<&str>,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<Option<T>, SyncError> {
        let rows = self.rows.read().expect("rows lock");
        let found = rows.iter().find(|(key, value)| match secondary_index {
            None => key == id,
            Some(index) => value.get(index).and_then(Value::as_str) == Some(id),
        });
        let Some((_, value)) = found else {
            return Ok(None);
        };
        if let Some(conditions) = conditions {
            if !matches_equalities(value, conditions) {
                return Ok(None);
            }
        }
        Ok(Some(serde_json::from_value(value.clone())?))
    }

    async fn set(
        &self,
        entity: T,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError> {
        let key = entity.primary_key();
        let value = serde_json::to_value(&entity)?;
        let mut rows = self.rows.write().expect("rows lock");
        match rows.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => {
                if let Some(conditions) = conditions {
                    if !matches_equalities(existing, conditions) {
                        return Err(SyncError::Store("set conditions not met".to_string()));
                    }
                }
                *existing = value;
            }
            None => rows.push((key, value)),
        }
        Ok(())
    }

    async fn remove(
        &self,
        id: &str,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError> {
        let mut rows = self.rows.write().expect("rows lock");
        if let Some(pos) = rows.iter().position(|(k, _)| k == id) {
            if let Some(conditions) = conditions {
                if !matches_equalities(&rows[pos].1, conditions) {
                    return Err(SyncError::Store("remove conditions not met".to_string()));
                }
            }
            rows.remove(pos);
        }
        Ok(())
    }

    async fn query(
        &self,
        condition: Option<&QueryCondition>,
        sort: Option<&[SortProperty]>,
        _properties: Option<&[String]>,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<QueryPage<T>, SyncError> {
        let rows = self.rows.read().expect("rows lock");
        let mut matched: Vec<&Value> = rows
            .iter()
            .map(|(_, value)| value)
            .filter(|value| condition.is_none_or(|c| matches_condition(value, c)))
            .collect();

        if let Some(sort) = sort {
            matched.sort_by(|a, b| {
                for prop in sort {
                    let ordering = match (a.get(&prop.property), b.get(&prop.property)) {
                        (Some(av), Some(bv)) => {
                            compare_values(av, bv).unwrap_or(std::cmp::Ordering::Equal)
                        }
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (None, None) => std::cmp::Ordering::Equal,
                    };
                    let ordering = match prop.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    };
                    if !ordering.is_eq() {
                        return ordering;
                    }
                }
                std::cmp::Ordering::Equal
            });
        }

        let offset: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let end = page_size.map_or(matched.len(), |size| (offset + size).min(matched.len()));
        let next_cursor = (end < matched.len()).then(|| end.to_string());

        let entities = matched
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|value| serde_json::from_value((*value).clone()))
            .collect::<Result<Vec<T>, _>>()?;

        Ok(QueryPage {
            entities,
            cursor: next_cursor,
        })
    }
}

/// Content-addressed blob store: the id is the sha-256 of the bytes.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().expect("blobs lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn set(&self, bytes: &[u8]) -> Result<String, SyncError> {
        let id = hex::encode(Sha256::digest(bytes));
        self.blobs
            .write()
            .expect("blobs lock")
            .insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self.blobs.read().expect("blobs lock").get(id).cloned())
    }
}

/// Named-slot pointer store; `create` is last-write-wins.
#[derive(Default)]
pub struct MemoryPointerStore {
    slots: RwLock<HashMap<String, (Vec<u8>, Vec<String>)>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PointerStore for MemoryPointerStore {
    async fn create(
        &self,
        key: &str,
        bytes: &[u8],
        allow_list: &[String],
    ) -> Result<(), SyncError> {
        self.slots
            .write()
            .expect("slots lock")
            .insert(key.to_string(), (bytes.to_vec(), allow_list.to_vec()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError> {
        Ok(self
            .slots
            .read()
            .expect("slots lock")
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }
}

/// Deterministic identity connector: the proof value is a digest over the
/// signer and the canonical payload. Not a real signature, but any mutation
/// of the signed content fails verification, which is what the engine's
/// gating relies on.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryIdentityConnector;

impl MemoryIdentityConnector {
    pub fn new() -> Self {
        Self
    }

    fn proof_value(signer: &str, payload: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(signer.as_bytes());
        // serde_json maps are key-ordered, so this serialization is canonical.
        hasher.update(payload.to_string().as_bytes());
        BASE64.encode(hasher.finalize())
    }
}

#[async_trait]
impl IdentityConnector for MemoryIdentityConnector {
    async fn create_proof(
        &self,
        signer: &str,
        verification_method: &str,
        payload: &Value,
    ) -> Result<DataIntegrityProof, SyncError> {
        Ok(DataIntegrityProof {
            context: PROOF_CONTEXT.to_string(),
            proof_type: PROOF_TYPE.to_string(),
            cryptosuite: PROOF_CRYPTOSUITE.to_string(),
            proof_purpose: PROOF_PURPOSE.to_string(),
            verification_method: verification_method.to_string(),
            created: Some(timestamp_now()),
            proof_value: Some(Self::proof_value(signer, payload)),
        })
    }

    async fn verify_proof(
        &self,
        payload: &Value,
        proof: &DataIntegrityProof,
    ) -> Result<bool, SyncError> {
        let Some(signer) = proof.verification_method.split('#').next() else {
            return Ok(false);
        };
        let Some(proof_value) = &proof.proof_value else {
            return Ok(false);
        };
        Ok(*proof_value == Self::proof_value(signer, payload))
    }
}

/// Trusted-peer stub that records every forwarded changeset blob id.
#[derive(Default)]
pub struct MemoryTrustedPeer {
    forwarded: Mutex<Vec<String>>,
}

impl MemoryTrustedPeer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forwarded(&self) -> Vec<String> {
        self.forwarded.lock().expect("forwarded lock").clone()
    }
}

#[async_trait]
impl TrustedPeer for MemoryTrustedPeer {
    async fn sync_change_set(&self, blob_id: &str) -> Result<(), SyncError> {
        self.forwarded
            .lock()
            .expect("forwarded lock")
            .push(blob_id.to_string());
        Ok(())
    }
}

/// Logger that records entries for assertions.
#[derive(Default)]
pub struct RecordingLogger {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().expect("entries lock").clone()
    }

    pub fn messages(&self) -> Vec<&'static str> {
        self.entries().iter().map(|e| e.message).collect()
    }
}

impl SyncLogger for RecordingLogger {
    fn log(&self, entry: LogEntry) {
        self.entries.lock().expect("entries lock").push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::SortProperty;
    use crate::test_support::TestItem;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_remove_round_trip() {
        let store = MemoryRowStore::<TestItem>::new();
        store.set(TestItem::new("1", "a", "b"), None).await.unwrap();

        let row = store.get("1", None, None).await.unwrap().unwrap();
        assert_eq!(row.value1, "a");

        store.remove("1", None).await.unwrap();
        assert!(store.get("1", None, None).await.unwrap().is_none());
        // Removing a missing row is not an error.
        store.remove("1", None).await.unwrap();
    }

    #[tokio::test]
    async fn conditional_set_guards_the_current_row() {
        let store = MemoryRowStore::<TestItem>::new();
        store.set(TestItem::new("1", "a", "b"), None).await.unwrap();

        let guard = [EqualityCondition::new("value1", json!("other"))];
        let err = store
            .set(TestItem::new("1", "c", "d"), Some(&guard))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));

        let guard = [EqualityCondition::new("value1", json!("a"))];
        store
            .set(TestItem::new("1", "c", "d"), Some(&guard))
            .await
            .unwrap();
        assert_eq!(
            store.get("1", None, None).await.unwrap().unwrap().value1,
            "c"
        );
    }

    #[tokio::test]
    async fn query_filters_sorts_and_pages() {
        let store = MemoryRowStore::<TestItem>::new();
        for (id, created) in [("b", "2"), ("a", "1"), ("c", "3")] {
            let item = TestItem::new(id, "v", "w")
                .with_created(&format!("2025-01-0{created}T00:00:00.000Z"));
            store.set(item, None).await.unwrap();
        }

        let sort = [SortProperty::ascending("dateCreated")];
        let page = store
            .query(None, Some(&sort), None, None, Some(2))
            .await
            .unwrap();
        assert_eq!(page.entities.len(), 2);
        assert_eq!(page.entities[0].id, "a");
        let cursor = page.cursor.unwrap();

        let rest = store
            .query(None, Some(&sort), None, Some(&cursor), Some(2))
            .await
            .unwrap();
        assert_eq!(rest.entities.len(), 1);
        assert_eq!(rest.entities[0].id, "c");
        assert!(rest.cursor.is_none());

        let condition = QueryCondition::equals("id", json!("b"));
        let page = store
            .query(Some(&condition), None, None, None, None)
            .await
            .unwrap();
        assert_eq!(page.entities.len(), 1);
        assert_eq!(page.entities[0].id, "b");
    }

    #[tokio::test]
    async fn secondary_index_lookup() {
        let store = MemoryRowStore::<TestItem>::new();
        store
            .set(TestItem::new("1", "alpha", "x"), None)
            .await
            .unwrap();
        let row = store
            .get("alpha", Some("value1"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id, "1");
    }

    #[tokio::test]
    async fn blob_store_is_content_addressed() {
        let store = MemoryBlobStore::new();
        let id1 = store.set(b"hello").await.unwrap();
        let id2 = store.set(b"hello").await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id1).await.unwrap().unwrap(), b"hello");
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn identity_proofs_break_on_tamper() {
        let identity = MemoryIdentityConnector::new();
        let payload = json!({ "id": "1", "changes": [] });
        let proof = identity
            .create_proof("did:example:a", "did:example:a#m", &payload)
            .await
            .unwrap();
        assert!(identity.verify_proof(&payload, &proof).await.unwrap());

        let tampered = json!({ "id": "2", "changes": [] });
        assert!(!identity.verify_proof(&tampered, &proof).await.unwrap());

        // A proof claiming a different signer also fails.
        let mut forged = proof.clone();
        forged.verification_method = "did:example:b#m".to_string();
        assert!(!identity.verify_proof(&payload, &forged).await.unwrap());
    }
}
