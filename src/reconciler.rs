use std::sync::Arc;

use serde_json::json;

use crate::changesets::ChangeSets;
use crate::connector::{LogEntry, LogLevel, SyncLogger};
use crate::entity::SyncEntity;
use crate::error::SyncError;
use crate::local_state::LocalState;
use crate::model::{SyncSnapshot, SyncState};

const LOG_SOURCE: &str = "reconciler";

/// Compares a remote sync-state against the locally mirrored snapshots and
/// drives per-changeset application for everything not seen yet.
pub struct Reconciler<T: SyncEntity> {
    local_state: Arc<LocalState>,
    change_sets: Arc<ChangeSets<T>>,
    logger: Arc<dyn SyncLogger>,
}

impl<T: SyncEntity> Reconciler<T> {
    pub fn new(
        local_state: Arc<LocalState>,
        change_sets: Arc<ChangeSets<T>>,
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        Self {
            local_state,
            change_sets,
            logger,
        }
    }

    /// Merge a remote sync-state into the local store.
    ///
    /// The remote snapshots are walked newest-first; the walk stops at the
    /// first snapshot whose mirror is already at the remote version, since
    /// everything older was mirrored before. The collected buckets are then
    /// applied oldest-first so later remote writes observationally overwrite
    /// earlier ones.
    pub async fn reconcile(&self, state: &SyncState) -> Result<(), SyncError> {
        let mut snapshots = state.snapshots.clone();
        // Newest first; ties on dateCreated break by lexical id order.
        snapshots.sort_by(|a, b| {
            (b.date_created.as_str(), b.id.as_str()).cmp(&(a.date_created.as_str(), a.id.as_str()))
        });

        let mut created = Vec::new();
        let mut modified = Vec::new();
        for snapshot in snapshots {
            match self.local_state.load_mirror(&snapshot.id).await? {
                None => created.push(snapshot),
                Some(mirror) if mirror.date_modified != snapshot.date_modified => {
                    modified.push((snapshot, mirror));
                }
                Some(_) => break,
            }
        }
        created.reverse();
        modified.reverse();

        for (snapshot, mirror) in modified {
            self.logger.log(
                LogEntry::new(LogLevel::Debug, LOG_SOURCE, "remoteSnapshotModified")
                    .data(json!({ "snapshotId": snapshot.id })),
            );
            let seen = mirror.change_set_storage_ids.unwrap_or_default();
            self.apply_snapshot(&snapshot, &seen).await?;
        }

        for snapshot in created {
            self.logger.log(
                LogEntry::new(LogLevel::Debug, LOG_SOURCE, "remoteSnapshotNew")
                    .data(json!({ "snapshotId": snapshot.id })),
            );
            self.apply_snapshot(&snapshot, &[]).await?;
        }

        Ok(())
    }

    /// Apply every changeset of `snapshot` not in `seen`, then upsert the
    /// mirror. A changeset that fails to fetch or apply is logged and skipped;
    /// the rest of the snapshot is still processed.
    async fn apply_snapshot(
        &self,
        snapshot: &SyncSnapshot,
        seen: &[String],
    ) -> Result<(), SyncError> {
        for blob_id in snapshot.change_set_storage_ids.iter().flatten() {
            if seen.iter().any(|s| s == blob_id) {
                continue;
            }
            if let Err(err) = self.change_sets.fetch_and_apply(blob_id).await {
                self.logger.log(
                    LogEntry::new(LogLevel::Error, LOG_SOURCE, "changeSetApplyFailed")
                        .data(json!({ "snapshotId": snapshot.id, "blobId": blob_id }))
                        .error(&err),
                );
            }
        }
        self.local_state.upsert_mirror(snapshot).await
    }
}
