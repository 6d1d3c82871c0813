use std::sync::Arc;

use serde_json::json;

use crate::codec;
use crate::connector::{
    BlobStore, IdentityConnector, LogEntry, LogLevel, RowStore, SyncLogger,
};
use crate::entity::SyncEntity;
use crate::error::SyncError;
use crate::model::{ChangeOperation, ChangeSet, DataIntegrityProof, proof_payload};

const LOG_SOURCE: &str = "changeSets";

/// Builds, signs, stores, fetches, verifies and applies changesets.
///
/// Changeset blobs are gzip-compressed JSON and deliberately unencrypted so
/// peers without pointer ACL can replay them; integrity is guaranteed by the
/// data-integrity proof.
pub struct ChangeSets<T: SyncEntity> {
    entity_store: Arc<dyn RowStore<T>>,
    blob_store: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityConnector>,
    method_id: String,
    logger: Arc<dyn SyncLogger>,
}

impl<T: SyncEntity> ChangeSets<T> {
    pub fn new(
        entity_store: Arc<dyn RowStore<T>>,
        blob_store: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityConnector>,
        method_id: impl Into<String>,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            entity_store,
            blob_store,
            identity,
            method_id: method_id.into(),
            logger,
        }
    }

    /// Create the proof for a changeset. The payload is the changeset with
    /// `proof` omitted; the verification method is `<nodeIdentity>#<methodId>`.
    pub async fn sign(&self, change_set: &ChangeSet) -> Result<DataIntegrityProof, SyncError> {
        let payload = proof_payload(change_set)?;
        let verification_method = format!("{}#{}", change_set.node_identity, self.method_id);
        self.identity
            .create_proof(&change_set.node_identity, &verification_method, &payload)
            .await
    }

    /// Verify a changeset's proof. An unsigned or invalid changeset yields
    /// `false` with an error log entry; verification never raises.
    pub async fn verify(&self, change_set: &ChangeSet) -> bool {
        let Some(proof) = &change_set.proof else {
            self.logger.log(
                LogEntry::new(LogLevel::Error, LOG_SOURCE, "changeSetProofMissing")
                    .data(json!({ "id": change_set.id })),
            );
            return false;
        };

        let verified = match proof_payload(change_set) {
            Ok(payload) => self.identity.verify_proof(&payload, proof).await,
            Err(err) => Err(SyncError::Serde(err)),
        };

        match verified {
            Ok(true) => true,
            Ok(false) => {
                self.logger.log(
                    LogEntry::new(LogLevel::Error, LOG_SOURCE, "changeSetProofInvalid")
                        .data(json!({ "id": change_set.id })),
                );
                false
            }
            Err(err) => {
                self.logger.log(
                    LogEntry::new(LogLevel::Error, LOG_SOURCE, "changeSetProofInvalid")
                        .data(json!({ "id": change_set.id }))
                        .error(&err),
                );
                false
            }
        }
    }

    /// Serialize, gzip and store a changeset; the blob id is its stable
    /// reference.
    pub async fn store(&self, change_set: &ChangeSet) -> Result<String, SyncError> {
        let bytes = serde_json::to_vec(change_set)?;
        let blob_id = self.blob_store.set(&codec::compress(&bytes)?).await?;
        self.logger.log(
            LogEntry::new(LogLevel::Debug, LOG_SOURCE, "changeSetStored").data(json!({
                "id": change_set.id,
                "blobId": blob_id,
            })),
        );
        Ok(blob_id)
    }

    /// Fetch a changeset blob; a missing blob is `Ok(None)`.
    pub async fn fetch(&self, blob_id: &str) -> Result<Option<ChangeSet>, SyncError> {
        let Some(bytes) = self.blob_store.get(blob_id).await? else {
            return Ok(None);
        };
        let change_set = serde_json::from_slice(&codec::decompress(&bytes)?)?;
        Ok(Some(change_set))
    }

    /// Fetch a changeset, verify it and apply it to the row store. Returns
    /// whether the changeset was applied. A missing blob or failed
    /// verification applies nothing; an error on one change is logged and
    /// does not prevent the next change from being processed.
    pub async fn fetch_and_apply(&self, blob_id: &str) -> Result<bool, SyncError> {
        let Some(change_set) = self.fetch(blob_id).await? else {
            self.logger.log(
                LogEntry::new(LogLevel::Warn, LOG_SOURCE, "changeSetNotFound")
                    .data(json!({ "blobId": blob_id })),
            );
            return Ok(false);
        };

        if !self.verify(&change_set).await {
            return Ok(false);
        }

        // Consolidation form: full rows, applied verbatim in authored order.
        if let Some(entities) = &change_set.entities {
            for value in entities {
                match serde_json::from_value::<T>(value.clone()) {
                    Ok(entity) => {
                        if let Err(err) = self.entity_store.set(entity, None).await {
                            self.log_apply_error(&change_set.id, &err);
                        }
                    }
                    Err(err) => self.log_apply_error(&change_set.id, &SyncError::Serde(err)),
                }
            }
        }

        // Incremental form: row-level operations in authored order.
        if let Some(changes) = &change_set.changes {
            for change in changes {
                let result = match change.operation {
                    ChangeOperation::Set => match &change.entity {
                        Some(value) => match serde_json::from_value::<T>(value.clone()) {
                            Ok(mut entity) => {
                                // The identity was stripped at publish time and
                                // the changeset carries it once at top level.
                                entity
                                    .set_node_identity(Some(change_set.node_identity.clone()));
                                self.entity_store.set(entity, None).await
                            }
                            Err(err) => Err(SyncError::Serde(err)),
                        },
                        None => Err(SyncError::State("set change without entity")),
                    },
                    ChangeOperation::Delete => match &change.id {
                        Some(id) => self.entity_store.remove(id, None).await,
                        None => Err(SyncError::State("delete change without id")),
                    },
                };
                if let Err(err) = result {
                    self.log_apply_error(&change_set.id, &err);
                }
            }
        }

        Ok(true)
    }

    fn log_apply_error(&self, change_set_id: &str, err: &SyncError) {
        self.logger.log(
            LogEntry::new(LogLevel::Error, LOG_SOURCE, "changeSetApplyFailed")
                .data(json!({ "id": change_set_id }))
                .error(err),
        );
    }
}
