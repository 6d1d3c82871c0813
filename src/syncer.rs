use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};

use crate::changesets::ChangeSets;
use crate::connector::{
    BlobStore, IdentityConnector, LogEntry, LogLevel, PointerStore, RowStore, SyncLogger,
    TracingLogger, TrustedPeer,
};
use crate::entity::SyncEntity;
use crate::error::SyncError;
use crate::facade::SyncedStore;
use crate::local_state::LocalState;
use crate::model::SyncSnapshot;
use crate::reconciler::Reconciler;
use crate::remote_state::RemoteState;

const LOG_SOURCE: &str = "syncer";

/// Engine configuration. Defaults match a conservative production cadence;
/// an interval of `0` disables the corresponding loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncOptions {
    /// Slot name identifying this logical store on the shared network.
    /// Required.
    pub verifiable_storage_key: String,
    /// DID verification-method fragment used for signing changesets.
    pub decentralised_storage_method_id: String,
    /// Background cadence for fetch + publish, in milliseconds.
    pub entity_update_interval_ms: u64,
    /// Trusted-node consolidation cadence, in milliseconds.
    pub consolidation_interval_ms: u64,
    /// Page size of the consolidation scan.
    pub consolidation_batch_size: usize,
    /// Trusted nodes append to the shared sync-state directly; untrusted
    /// nodes forward changesets to a trusted peer.
    pub is_trusted_node: bool,
    /// Entity context for the local bookkeeping rows; defaults to the
    /// verifiable storage key.
    pub context: Option<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            verifiable_storage_key: String::new(),
            decentralised_storage_method_id: "decentralised-storage-assertion".to_string(),
            entity_update_interval_ms: 300_000,
            consolidation_interval_ms: 3_600_000,
            consolidation_batch_size: 1000,
            is_trusted_node: false,
            context: None,
        }
    }
}

/// The narrow capability records the engine is constructed from.
pub struct SyncConnectors<T: SyncEntity> {
    pub entity_store: Arc<dyn RowStore<T>>,
    pub snapshot_store: Arc<dyn RowStore<SyncSnapshot>>,
    pub blob_store: Arc<dyn BlobStore>,
    pub pointer_store: Arc<dyn PointerStore>,
    pub identity: Arc<dyn IdentityConnector>,
    /// Required for untrusted nodes, unused on trusted ones.
    pub trusted_peer: Option<Arc<dyn TrustedPeer>>,
    /// Defaults to [`TracingLogger`] when absent.
    pub logger: Option<Arc<dyn SyncLogger>>,
}

enum Role {
    Trusted,
    Untrusted(Arc<dyn TrustedPeer>),
}

/// Owns the two background loops, the trusted/untrusted routing and the
/// engine lifecycle. `start` records the node identity and kicks both loops
/// immediately; `stop` cancels the scheduling of further iterations while an
/// in-flight iteration runs to completion. Restart is idempotent.
pub struct Syncer<T: SyncEntity> {
    inner: Arc<Engine<T>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: SyncEntity> std::fmt::Debug for Syncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer").finish_non_exhaustive()
    }
}

struct Engine<T: SyncEntity> {
    options: SyncOptions,
    role: Role,
    node_identity: Arc<RwLock<Option<String>>>,
    entity_store: Arc<dyn RowStore<T>>,
    local_state: Arc<LocalState>,
    remote_state: RemoteState<T>,
    reconciler: Reconciler<T>,
    pending_claim: Arc<tokio::sync::Mutex<()>>,
    logger: Arc<dyn SyncLogger>,
}

impl<T: SyncEntity> Syncer<T> {
    /// Validate the configuration and assemble the engine. An untrusted node
    /// without a trusted-peer connector fails fast here.
    pub fn new(options: SyncOptions, connectors: SyncConnectors<T>) -> Result<Self, SyncError> {
        if options.verifiable_storage_key.is_empty() {
            return Err(SyncError::Config("verifiableStorageKey is required"));
        }
        let role = if options.is_trusted_node {
            Role::Trusted
        } else {
            match connectors.trusted_peer {
                Some(peer) => Role::Untrusted(peer),
                None => {
                    return Err(SyncError::Config(
                        "untrusted node requires a trusted peer connector",
                    ));
                }
            }
        };

        let logger = connectors
            .logger
            .unwrap_or_else(|| Arc::new(TracingLogger));
        let context = options
            .context
            .clone()
            .unwrap_or_else(|| options.verifiable_storage_key.clone());

        let local_state = Arc::new(LocalState::new(
            connectors.snapshot_store,
            context,
            logger.clone(),
        ));
        let change_sets = Arc::new(ChangeSets::new(
            connectors.entity_store.clone(),
            connectors.blob_store.clone(),
            connectors.identity,
            options.decentralised_storage_method_id.clone(),
            logger.clone(),
        ));
        let remote_state = RemoteState::new(
            connectors.entity_store.clone(),
            connectors.blob_store,
            connectors.pointer_store,
            change_sets.clone(),
            logger.clone(),
        );
        let reconciler = Reconciler::new(local_state.clone(), change_sets, logger.clone());

        Ok(Self {
            inner: Arc::new(Engine {
                options,
                role,
                node_identity: Arc::new(RwLock::new(None)),
                entity_store: connectors.entity_store,
                local_state,
                remote_state,
                reconciler,
                pending_claim: Arc::new(tokio::sync::Mutex::new(())),
                logger,
            }),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The storage facade backed by this engine.
    pub fn store(&self) -> SyncedStore<T> {
        SyncedStore::new(
            self.inner.entity_store.clone(),
            self.inner.local_state.clone(),
            self.inner.node_identity.clone(),
            self.inner.pending_claim.clone(),
        )
    }

    /// Record the node identity and start the background loops. Both loops
    /// run one iteration immediately. Calling `start` on a running engine
    /// restarts it.
    pub async fn start(&self, node_identity: &str) {
        self.stop().await;
        *self
            .inner
            .node_identity
            .write()
            .expect("node identity lock") = Some(node_identity.to_string());

        let (tx, _) = watch::channel(false);
        let mut tasks = Vec::new();

        if self.inner.options.entity_update_interval_ms > 0 {
            let engine = self.inner.clone();
            let mut shutdown = tx.subscribe();
            let period = Duration::from_millis(self.inner.options.entity_update_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = engine.entity_update_once().await {
                                engine.logger.log(
                                    LogEntry::new(LogLevel::Error, LOG_SOURCE, "entityUpdateFailed")
                                        .error(&err),
                                );
                            }
                        }
                    }
                }
            }));
        }

        if matches!(self.inner.role, Role::Trusted)
            && self.inner.options.consolidation_interval_ms > 0
        {
            let engine = self.inner.clone();
            let mut shutdown = tx.subscribe();
            let period = Duration::from_millis(self.inner.options.consolidation_interval_ms);
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            if let Err(err) = engine.consolidate_once().await {
                                engine.logger.log(
                                    LogEntry::new(LogLevel::Error, LOG_SOURCE, "consolidationFailed")
                                        .error(&err),
                                );
                            }
                        }
                    }
                }
            }));
        }

        *self.shutdown.lock().expect("shutdown lock") = Some(tx);
        *self.tasks.lock().expect("tasks lock") = tasks;
    }

    /// Cancel the scheduling of further iterations and wait for the loop
    /// tasks to finish their current one.
    pub async fn stop(&self) {
        let sender = self.shutdown.lock().expect("shutdown lock").take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let tasks: Vec<_> = {
            let mut guard = self.tasks.lock().expect("tasks lock");
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Run one entity-update iteration (fetch remote, then publish local)
    /// outside the timer loop. Hosts that drive their own scheduler use this
    /// with the intervals set to `0`.
    pub async fn sync_once(&self) -> Result<(), SyncError> {
        self.inner.entity_update_once().await
    }

    /// Run one consolidation outside the timer loop (trusted nodes only).
    pub async fn consolidate_once(&self) -> Result<(), SyncError> {
        if !matches!(self.inner.role, Role::Trusted) {
            return Err(SyncError::State("consolidation requires a trusted node"));
        }
        self.inner.consolidate_once().await
    }
}

impl<T: SyncEntity> Engine<T> {
    fn require_node_identity(&self) -> Result<String, SyncError> {
        self.node_identity
            .read()
            .expect("node identity lock")
            .clone()
            .ok_or(SyncError::State("node identity not set, engine not started"))
    }

    async fn entity_update_once(&self) -> Result<(), SyncError> {
        self.update_from_remote().await?;
        self.update_from_local().await
    }

    /// Pull the remote sync-state and reconcile it into the local store. A
    /// missing pointer or sync-state means there is nothing to pull yet.
    async fn update_from_remote(&self) -> Result<(), SyncError> {
        let key = &self.options.verifiable_storage_key;
        let Some(pointer) = self.remote_state.read_pointer(key).await? else {
            return Ok(());
        };
        let Some(state) = self
            .remote_state
            .read_sync_state(&pointer.sync_pointer_id)
            .await?
        else {
            return Ok(());
        };
        self.reconciler.reconcile(&state).await
    }

    /// Publish the pending local snapshot, routing by role. The snapshot is
    /// claimed (removed) before the publish, so a mutation arriving
    /// mid-publish opens a fresh pending snapshot; on failure the claimed
    /// snapshot is merged back so the next tick retries it.
    async fn update_from_local(&self) -> Result<(), SyncError> {
        let pending = {
            let _claim = self.pending_claim.lock().await;
            self.local_state.take_pending().await?
        };
        let Some(snapshot) = pending else {
            return Ok(());
        };

        let result = self.publish_pending(&snapshot).await;
        if result.is_err() {
            self.restore_pending(snapshot).await;
        }
        result
    }

    async fn publish_pending(&self, snapshot: &SyncSnapshot) -> Result<(), SyncError> {
        let identity = self.require_node_identity()?;
        let changes = snapshot.changes.clone().unwrap_or_default();
        let Some(blob_id) = self
            .remote_state
            .publish_change_set(&changes, &identity)
            .await?
        else {
            return Ok(());
        };

        match &self.role {
            Role::Trusted => {
                self.remote_state
                    .append_to_sync_state(&self.options.verifiable_storage_key, &identity, &blob_id)
                    .await
            }
            Role::Untrusted(peer) => {
                peer.sync_change_set(&blob_id).await?;
                self.logger.log(
                    LogEntry::new(LogLevel::Debug, LOG_SOURCE, "changeSetForwarded")
                        .data(serde_json::json!({ "blobId": blob_id })),
                );
                Ok(())
            }
        }
    }

    async fn restore_pending(&self, snapshot: SyncSnapshot) {
        let _claim = self.pending_claim.lock().await;
        if let Err(restore_err) = self.local_state.replace_pending(snapshot).await {
            self.logger.log(
                LogEntry::new(LogLevel::Error, LOG_SOURCE, "pendingSnapshotRestoreFailed")
                    .error(&restore_err),
            );
        }
    }

    /// Consolidation replaces incremental state: the pending snapshot is
    /// claimed away first and merged back if the consolidation fails.
    async fn consolidate_once(&self) -> Result<(), SyncError> {
        let identity = self.require_node_identity()?;

        let pending = {
            let _claim = self.pending_claim.lock().await;
            self.local_state.take_pending().await?
        };

        let result = self
            .remote_state
            .consolidate(
                &identity,
                &self.options.verifiable_storage_key,
                self.options.consolidation_batch_size,
            )
            .await;

        if result.is_err() {
            if let Some(snapshot) = pending {
                self.restore_pending(snapshot).await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::NoopLogger;
    use crate::memory::{
        MemoryBlobStore, MemoryIdentityConnector, MemoryPointerStore, MemoryRowStore,
        MemoryTrustedPeer,
    };
    use crate::test_support::TestItem;

    fn connectors(
        trusted_peer: Option<Arc<dyn TrustedPeer>>,
    ) -> SyncConnectors<TestItem> {
        SyncConnectors {
            entity_store: Arc::new(MemoryRowStore::<TestItem>::new()),
            snapshot_store: Arc::new(MemoryRowStore::<SyncSnapshot>::new()),
            blob_store: Arc::new(MemoryBlobStore::new()),
            pointer_store: Arc::new(MemoryPointerStore::new()),
            identity: Arc::new(MemoryIdentityConnector::new()),
            trusted_peer,
            logger: Some(Arc::new(NoopLogger)),
        }
    }

    fn trusted_options() -> SyncOptions {
        SyncOptions {
            verifiable_storage_key: "test-store".to_string(),
            is_trusted_node: true,
            entity_update_interval_ms: 0,
            consolidation_interval_ms: 0,
            ..SyncOptions::default()
        }
    }

    #[test]
    fn storage_key_is_required() {
        let err = Syncer::new(SyncOptions::default(), connectors(None)).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn untrusted_node_without_peer_fails_fast() {
        let options = SyncOptions {
            verifiable_storage_key: "test-store".to_string(),
            ..SyncOptions::default()
        };
        let err = Syncer::new(options, connectors(None)).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));

        let options = SyncOptions {
            verifiable_storage_key: "test-store".to_string(),
            ..SyncOptions::default()
        };
        let peer: Arc<dyn TrustedPeer> = Arc::new(MemoryTrustedPeer::new());
        assert!(Syncer::new(options, connectors(Some(peer))).is_ok());
    }

    #[tokio::test]
    async fn consolidate_once_is_trusted_only() {
        let peer: Arc<dyn TrustedPeer> = Arc::new(MemoryTrustedPeer::new());
        let options = SyncOptions {
            verifiable_storage_key: "test-store".to_string(),
            entity_update_interval_ms: 0,
            ..SyncOptions::default()
        };
        let syncer = Syncer::new(options, connectors(Some(peer))).unwrap();
        syncer.start("did:example:node1").await;
        let err = syncer.consolidate_once().await.unwrap_err();
        assert!(matches!(err, SyncError::State(_)));
        syncer.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let syncer = Syncer::new(trusted_options(), connectors(None)).unwrap();
        syncer.start("did:example:node1").await;
        syncer.start("did:example:node1").await;
        syncer.stop().await;
        syncer.stop().await;
    }

    #[tokio::test]
    async fn loops_fire_immediately_on_start() {
        let mut options = trusted_options();
        // Long period: only the immediate first tick can have fired.
        options.entity_update_interval_ms = 3_600_000;
        let mut conns = connectors(None);
        let logger = Arc::new(crate::memory::RecordingLogger::new());
        conns.logger = Some(logger.clone());
        let syncer = Syncer::new(options, conns).unwrap();

        syncer.start("did:example:node1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        syncer.stop().await;

        let messages = logger.messages();
        assert!(messages.contains(&"verifiableSyncPointerRetrieving"));
    }
}
