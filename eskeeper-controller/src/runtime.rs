//! Per-kind stores and the controllers running on them.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use eskeeper_reconcile::store::Result as StoreResult;
use eskeeper_reconcile::{
    Adapter, Controller, ControllerConfig, Declared, EventRecorder, FileStore, ResourceKey,
    ResourceReconciler, ResourceSpec, ResourceStore, StoreError,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clients::EsClient;
use crate::connection::{EsHandleFactory, EsLookup};
use crate::reconciler::{
    LifecyclePolicyAdapter, LifecyclePolicySpec, RoleMappingAdapter, RoleMappingSpec,
    SnapshotLifecyclePolicyAdapter, SnapshotLifecyclePolicySpec, WatchAdapter, WatchSpec,
};

/// One store per resource kind.
#[derive(Clone)]
pub struct Stores {
    pub role_mappings: Arc<FileStore<RoleMappingSpec>>,
    pub lifecycle_policies: Arc<FileStore<LifecyclePolicySpec>>,
    pub snapshot_policies: Arc<FileStore<SnapshotLifecyclePolicySpec>>,
    pub watches: Arc<FileStore<WatchSpec>>,
}

async fn open_kind<S: ResourceSpec>(state_dir: &Path) -> Result<Arc<FileStore<S>>> {
    let dir = state_dir.join(S::KIND);
    let store = FileStore::open(&dir)
        .await
        .with_context(|| format!("Failed to open {} store in {}", S::KIND, dir.display()))?;
    Ok(Arc::new(store))
}

impl Stores {
    /// Open the stores under `state_dir`, one subdirectory per kind.
    pub async fn open(state_dir: &Path) -> Result<Self> {
        Ok(Self {
            role_mappings: open_kind(state_dir).await?,
            lifecycle_policies: open_kind(state_dir).await?,
            snapshot_policies: open_kind(state_dir).await?,
            watches: open_kind(state_dir).await?,
        })
    }
}

/// Apply a declared resource. Returns whether the store changed.
pub(crate) async fn apply_to<S: ResourceSpec>(
    store: &FileStore<S>,
    resource: Declared<S>,
) -> StoreResult<bool> {
    let before = store
        .get(&resource.key())
        .await?
        .map(|r| r.metadata.resource_version);
    let after = store.apply(resource).await?;
    Ok(before != Some(after.metadata.resource_version))
}

/// Request deletion. A resource that is already gone is fine.
pub(crate) async fn delete_from<S: ResourceSpec>(
    store: &FileStore<S>,
    key: &ResourceKey,
) -> StoreResult<()> {
    match store.request_deletion(key).await {
        Ok(()) => Ok(()),
        Err(StoreError::NotFound(_)) => {
            debug!("{} {} already removed", S::KIND, key);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Resources carrying `label`, paired with its value. Resources being
/// deleted are left out.
pub(crate) async fn labelled<S: ResourceSpec>(
    store: &FileStore<S>,
    label: &str,
) -> StoreResult<Vec<(String, ResourceKey)>> {
    Ok(store
        .list()
        .await?
        .into_iter()
        .filter(|r| !r.is_being_deleted())
        .filter_map(|r| {
            let value = r.metadata.labels.get(label)?.clone();
            Some((value, r.key()))
        })
        .collect())
}

/// Everything the controllers share.
pub struct Runtime {
    stores: Stores,
    lookup: EsLookup,
    factory: EsHandleFactory,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
}

impl Runtime {
    pub fn new(
        stores: Stores,
        lookup: EsLookup,
        factory: EsHandleFactory,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            stores,
            lookup,
            factory,
            recorder,
            config,
        }
    }

    /// Start one controller per kind. They stop when `shutdown` turns true.
    pub async fn spawn_controllers(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        Ok(vec![
            self.spawn(RoleMappingAdapter, &self.stores.role_mappings, shutdown.clone())
                .await?,
            self.spawn(
                LifecyclePolicyAdapter,
                &self.stores.lifecycle_policies,
                shutdown.clone(),
            )
            .await?,
            self.spawn(
                SnapshotLifecyclePolicyAdapter,
                &self.stores.snapshot_policies,
                shutdown.clone(),
            )
            .await?,
            self.spawn(WatchAdapter, &self.stores.watches, shutdown).await?,
        ])
    }

    async fn spawn<A>(
        &self,
        adapter: A,
        store: &Arc<FileStore<A::Spec>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>>
    where
        A: Adapter<Handle = EsClient>,
    {
        // Subscribe before listing so no change falls in between
        let triggers = store.subscribe();
        let initial = store.list().await?.iter().map(|r| r.key()).collect();

        let reconciler = ResourceReconciler::new(
            adapter,
            store.clone(),
            self.lookup.clone(),
            self.factory.clone(),
            self.recorder.clone(),
            self.config.clone(),
        );
        let controller = Controller::new(Arc::new(reconciler), self.config.clone());
        Ok(tokio::spawn(controller.run(initial, triggers, shutdown)))
    }
}
