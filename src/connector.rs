use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::StorageEntity;
use crate::error::SyncError;
use crate::model::DataIntegrityProof;

/// Comparison applied by a single query condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LogicOperator {
    And,
    Or,
}

/// Leaf condition: compare one property of the row against a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyCondition {
    pub property: String,
    pub value: Value,
    pub comparison: Comparison,
}

/// Condition tree of property comparisons joined by AND/OR.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryCondition {
    Property(PropertyCondition),
    Group {
        logic: LogicOperator,
        conditions: Vec<QueryCondition>,
    },
}

impl QueryCondition {
    pub fn equals(property: impl Into<String>, value: Value) -> Self {
        QueryCondition::Property(PropertyCondition {
            property: property.into(),
            value,
            comparison: Comparison::Equals,
        })
    }

    pub fn all(conditions: Vec<QueryCondition>) -> Self {
        QueryCondition::Group {
            logic: LogicOperator::And,
            conditions,
        }
    }
}

/// AND-list guard for conditional writes: "update only if the current row
/// matches every property/value pair".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EqualityCondition {
    pub property: String,
    pub value: Value,
}

impl EqualityCondition {
    pub fn new(property: impl Into<String>, value: Value) -> Self {
        Self {
            property: property.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortProperty {
    pub property: String,
    pub direction: SortDirection,
}

impl SortProperty {
    pub fn ascending(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            direction: SortDirection::Ascending,
        }
    }
}

/// One page of query results; `cursor` is present when more rows remain.
#[derive(Debug, Clone)]
pub struct QueryPage<T> {
    pub entities: Vec<T>,
    pub cursor: Option<String>,
}

/// The underlying row store: key/value with a secondary-index query API.
/// Opaque to the engine; a missing row is `Ok(None)`, never an error.
#[async_trait]
pub trait RowStore<T: StorageEntity>: Send + Sync {
    async fn get(
        &self,
        id: &str,
        secondary_index: Option<&str>,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<Option<T>, SyncError>;

    /// Upsert. When `conditions` are given and a current row exists, the
    /// write only proceeds if that row matches every condition.
    async fn set(
        &self,
        entity: T,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError>;

    async fn remove(
        &self,
        id: &str,
        conditions: Option<&[EqualityCondition]>,
    ) -> Result<(), SyncError>;

    /// `properties` is a projection hint; typed stores may ignore it and
    /// return full rows.
    async fn query(
        &self,
        condition: Option<&QueryCondition>,
        sort: Option<&[SortProperty]>,
        properties: Option<&[String]>,
        cursor: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<QueryPage<T>, SyncError>;
}

/// Content-addressed byte store holding changeset and sync-state blobs.
/// Ids are stable strings; a missing blob is `Ok(None)`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn set(&self, bytes: &[u8]) -> Result<String, SyncError>;
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, SyncError>;
}

/// Named-slot store with authorship ACL holding the sync pointer.
/// `create` is last-write-wins for the slot.
#[async_trait]
pub trait PointerStore: Send + Sync {
    async fn create(
        &self,
        key: &str,
        bytes: &[u8],
        allow_list: &[String],
    ) -> Result<(), SyncError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SyncError>;
}

/// Decentralised identity collaborator: creates and verifies data-integrity
/// proofs. JCS canonicalisation of the payload happens behind this trait.
#[async_trait]
pub trait IdentityConnector: Send + Sync {
    async fn create_proof(
        &self,
        signer: &str,
        verification_method: &str,
        payload: &Value,
    ) -> Result<DataIntegrityProof, SyncError>;

    async fn verify_proof(
        &self,
        payload: &Value,
        proof: &DataIntegrityProof,
    ) -> Result<bool, SyncError>;
}

/// RPC surface of a trusted peer; untrusted nodes forward the blob id of each
/// signed changeset here instead of writing the shared sync-state themselves.
#[async_trait]
pub trait TrustedPeer: Send + Sync {
    async fn sync_change_set(&self, blob_id: &str) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured log record; every log site in the engine emits one of these.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: &'static str, message: &'static str) -> Self {
        Self {
            level,
            source,
            message,
            data: None,
            error: None,
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn error(mut self, error: &SyncError) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Logger capability handed to the engine; may be a no-op.
pub trait SyncLogger: Send + Sync {
    fn log(&self, entry: LogEntry);
}

/// Default logger: forwards entries to the `tracing` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl SyncLogger for TracingLogger {
    fn log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Debug => tracing::debug!(
                source = entry.source,
                data = ?entry.data,
                error = ?entry.error,
                "{}",
                entry.message
            ),
            LogLevel::Info => tracing::info!(
                source = entry.source,
                data = ?entry.data,
                error = ?entry.error,
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                source = entry.source,
                data = ?entry.data,
                error = ?entry.error,
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                source = entry.source,
                data = ?entry.data,
                error = ?entry.error,
                "{}",
                entry.message
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl SyncLogger for NoopLogger {
    fn log(&self, _entry: LogEntry) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_entry_builder_attaches_data_and_error() {
        let err = SyncError::Store("down".to_string());
        let entry = LogEntry::new(LogLevel::Error, "remoteState", "syncStateStoring")
            .data(json!({ "blobId": "abc" }))
            .error(&err);
        assert_eq!(entry.level, LogLevel::Error);
        assert_eq!(entry.data.unwrap()["blobId"], "abc");
        assert_eq!(entry.error.unwrap(), "store: down");
    }

    #[test]
    fn condition_helpers_build_and_groups() {
        let cond = QueryCondition::all(vec![
            QueryCondition::equals("isLocalSnapshot", json!(true)),
            QueryCondition::equals("context", json!("items")),
        ]);
        match cond {
            QueryCondition::Group { logic, conditions } => {
                assert_eq!(logic, LogicOperator::And);
                assert_eq!(conditions.len(), 2);
            }
            _ => panic!("expected group"),
        }
    }
}
