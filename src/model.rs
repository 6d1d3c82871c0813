use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::StorageEntity;

/// W3C data-integrity proof constants; the shared log is always signed this way.
pub const PROOF_TYPE: &str = "DataIntegrityProof";
pub const PROOF_CRYPTOSUITE: &str = "eddsa-jcs-2022";
pub const PROOF_PURPOSE: &str = "assertionMethod";
pub const PROOF_CONTEXT: &str = "https://www.w3.org/ns/credentials/v2";

/// Reserved entity property names used by the engine.
pub const PROPERTY_NODE_IDENTITY: &str = "nodeIdentity";
pub const PROPERTY_DATE_CREATED: &str = "dateCreated";
pub const PROPERTY_IS_LOCAL_SNAPSHOT: &str = "isLocalSnapshot";
pub const PROPERTY_CONTEXT: &str = "context";

/// Row-level operation type carried in a changeset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Set,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeOperation::Set => "set",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// One row-level change. Pending "set" changes carry only the primary key;
/// the full row is expanded in at publish time and the key is dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub operation: ChangeOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>, // primary key (pending set, and every delete)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>, // full row (published set)
}

impl SyncChange {
    pub fn set(id: impl Into<String>) -> Self {
        Self {
            operation: ChangeOperation::Set,
            id: Some(id.into()),
            entity: None,
        }
    }

    pub fn set_entity(entity: Value) -> Self {
        Self {
            operation: ChangeOperation::Set,
            id: None,
            entity: Some(entity),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            operation: ChangeOperation::Delete,
            id: Some(id.into()),
            entity: None,
        }
    }
}

/// Proof attached to every published changeset.
/// The JCS canonicalisation of the payload with `proof` omitted is what is signed;
/// canonicalisation is the identity connector's job, not the engine's.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataIntegrityProof {
    #[serde(rename = "@context")]
    pub context: String,
    #[serde(rename = "type")]
    pub proof_type: String,
    pub cryptosuite: String,
    pub proof_purpose: String,
    pub verification_method: String, // "<nodeIdentity>#<methodId>"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_value: Option<String>,
}

/// Signed, ordered collection of changes authored by one node.
/// Incremental changesets carry `changes`; consolidation snapshots carry
/// `entities`; never both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub id: String,           // random 256-bit hex
    pub date_created: String, // ISO-8601
    pub node_identity: String, // signer DID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<SyncChange>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<DataIntegrityProof>,
}

/// Snapshot entry: groups changeset blob ids inside a sync-state, and doubles
/// as the row stored locally both for the pending change set
/// (`is_local_snapshot = true`, `changes` populated) and for the mirror of
/// every remote snapshot ever observed (`change_set_storage_ids` populated).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub id: String,           // random 256-bit hex, globally unique
    pub date_created: String, // chronological order inside a sync-state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_modified: Option<String>, // advances on any append
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_set_storage_ids: Option<Vec<String>>, // append-only within a snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<Vec<SyncChange>>, // pending local form only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_local_snapshot: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>, // entity context this row belongs to
}

impl StorageEntity for SyncSnapshot {
    fn primary_key(&self) -> String {
        self.id.clone()
    }
}

/// The top-level object published per logical store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub snapshots: Vec<SyncSnapshot>,
}

/// Value of the single named slot in the verifiable-pointer store: the blob
/// id of the current sync-state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPointer {
    pub sync_pointer_id: String,
}

/// Random 256-bit identifier, hex encoded.
pub fn random_id() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

/// Current time as ISO-8601 with millisecond precision, e.g.
/// "2025-05-29T07:00:00.000Z". Lexical order equals chronological order.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serialize a changeset with its `proof` omitted; this is the signing payload.
pub fn proof_payload(change_set: &ChangeSet) -> Result<Value, serde_json::Error> {
    let mut payload = serde_json::to_value(change_set)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.remove("proof");
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_256_bit_hex() {
        let id = random_id();
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }

    #[test]
    fn timestamps_have_millisecond_precision() {
        let ts = timestamp_now();
        assert!(ts.ends_with('Z'));
        // "2025-05-29T07:00:00.000Z" is 24 chars
        assert_eq!(ts.len(), 24);
    }

    #[test]
    fn changes_serialize_with_operation_tag() {
        let set = SyncChange::set("111");
        let json = serde_json::to_value(&set).unwrap();
        assert_eq!(json["operation"], "set");
        assert_eq!(json["id"], "111");
        assert!(json.get("entity").is_none());

        let delete = SyncChange::delete("222");
        let json = serde_json::to_value(&delete).unwrap();
        assert_eq!(json["operation"], "delete");
        assert_eq!(json["id"], "222");
    }

    #[test]
    fn proof_payload_elides_proof() {
        let cs = ChangeSet {
            id: random_id(),
            date_created: timestamp_now(),
            node_identity: "did:example:node".to_string(),
            changes: Some(vec![SyncChange::delete("1")]),
            entities: None,
            proof: Some(DataIntegrityProof {
                context: PROOF_CONTEXT.to_string(),
                proof_type: PROOF_TYPE.to_string(),
                cryptosuite: PROOF_CRYPTOSUITE.to_string(),
                proof_purpose: PROOF_PURPOSE.to_string(),
                verification_method: "did:example:node#key".to_string(),
                created: None,
                proof_value: Some("zzz".to_string()),
            }),
        };
        let payload = proof_payload(&cs).unwrap();
        assert!(payload.get("proof").is_none());
        assert_eq!(payload["nodeIdentity"], "did:example:node");
    }

    #[test]
    fn snapshot_wire_format_is_camel_case() {
        let snapshot = SyncSnapshot {
            id: "abc".to_string(),
            date_created: "2025-05-29T07:00:00.000Z".to_string(),
            date_modified: None,
            change_set_storage_ids: Some(vec!["blob1".to_string()]),
            changes: None,
            is_local_snapshot: None,
            context: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["dateCreated"], "2025-05-29T07:00:00.000Z");
        assert_eq!(json["changeSetStorageIds"][0], "blob1");
        assert!(json.get("dateModified").is_none());
        assert!(json.get("isLocalSnapshot").is_none());
    }
}
