//! In-memory resource store with change notifications.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::{ResourceStore, Result, StoreError};
use crate::condition::ReconcileStatus;
use crate::resource::{Declared, FINALIZER, ResourceKey, ResourceSpec};

const EVENT_CAPACITY: usize = 1024;

/// Resource store backed by a map. Declarer writes are published on a
/// broadcast channel so a controller can watch them.
pub struct MemoryStore<S> {
    resources: RwLock<HashMap<ResourceKey, Declared<S>>>,
    events: broadcast::Sender<ResourceKey>,
}

impl<S: ResourceSpec> Default for MemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ResourceSpec> MemoryStore<S> {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resources: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Store holding `resources` as they are, status and finalizers included.
    pub(crate) fn with_resources(resources: impl IntoIterator<Item = Declared<S>>) -> Self {
        let store = Self::new();
        let resources = resources.into_iter().map(|r| (r.key(), r)).collect();
        Self {
            resources: RwLock::new(resources),
            ..store
        }
    }

    /// Subscribe to keys of resources changed by the declarer.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceKey> {
        self.events.subscribe()
    }

    fn notify(&self, key: &ResourceKey) {
        // No subscribers is fine
        let _ = self.events.send(key.clone());
    }
}

#[async_trait]
impl<S: ResourceSpec> ResourceStore<S> for MemoryStore<S> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Declared<S>>> {
        Ok(self.resources.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<Declared<S>>> {
        let resources = self.resources.read().await;
        let mut list: Vec<_> = resources.values().cloned().collect();
        list.sort_by_key(|r| r.key());
        Ok(list)
    }

    async fn apply(&self, resource: Declared<S>) -> Result<Declared<S>> {
        let key = resource.key();
        let mut resources = self.resources.write().await;

        let stored = match resources.get_mut(&key) {
            Some(existing) => {
                let requested = resource.metadata.resource_version;
                if requested != 0 && requested != existing.metadata.resource_version {
                    return Err(StoreError::VersionMismatch {
                        key: key.to_string(),
                        expected: existing.metadata.resource_version,
                        actual: requested,
                    });
                }
                if existing.spec == resource.spec
                    && existing.metadata.labels == resource.metadata.labels
                {
                    return Ok(existing.clone());
                }
                if existing.spec != resource.spec {
                    existing.metadata.generation += 1;
                    existing.spec = resource.spec;
                }
                existing.metadata.labels = resource.metadata.labels;
                existing.metadata.resource_version += 1;
                existing.clone()
            }
            None => {
                let mut created = resource;
                created.metadata.generation = 1;
                created.metadata.resource_version = 1;
                created.metadata.finalizers.clear();
                created.metadata.deletion_timestamp = None;
                created.status = ReconcileStatus::default();
                resources.insert(key.clone(), created.clone());
                created
            }
        };
        drop(resources);

        debug!(
            "Applied {} {} (generation {})",
            S::KIND,
            key,
            stored.metadata.generation
        );
        self.notify(&key);
        Ok(stored)
    }

    async fn request_deletion(&self, key: &ResourceKey) -> Result<()> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if resource.metadata.finalizers.is_empty() {
            resources.remove(key);
            debug!("Removed {} {}", S::KIND, key);
        } else if resource.metadata.deletion_timestamp.is_none() {
            resource.metadata.deletion_timestamp = Some(Utc::now());
            resource.metadata.resource_version += 1;
            debug!("Marked {} {} for deletion", S::KIND, key);
        }
        drop(resources);

        self.notify(key);
        Ok(())
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        status: ReconcileStatus,
    ) -> Result<Declared<S>> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        resource.status = status;
        resource.metadata.resource_version += 1;
        Ok(resource.clone())
    }

    async fn add_finalizer(&self, key: &ResourceKey) -> Result<Declared<S>> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        if !resource.has_finalizer() {
            resource.metadata.finalizers.push(FINALIZER.to_string());
            resource.metadata.resource_version += 1;
        }
        Ok(resource.clone())
    }

    async fn remove_finalizer(&self, key: &ResourceKey) -> Result<Option<Declared<S>>> {
        let mut resources = self.resources.write().await;
        let resource = resources
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        resource.metadata.finalizers.retain(|f| f != FINALIZER);
        resource.metadata.resource_version += 1;

        if resource.is_being_deleted() && resource.metadata.finalizers.is_empty() {
            resources.remove(key);
            debug!("Released {} {}", S::KIND, key);
            return Ok(None);
        }
        Ok(Some(resource.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::testing::{TestSpec, spec};

    fn admins() -> Declared<TestSpec> {
        Declared::new("default", "admins", spec(&["superuser"]))
    }

    #[tokio::test]
    async fn test_apply_create_and_update() {
        let store = MemoryStore::<TestSpec>::new();

        let created = store.apply(admins()).await.unwrap();
        assert_eq!(created.metadata.generation, 1);
        assert_eq!(created.metadata.resource_version, 1);

        // Same spec is a no-op
        let same = store.apply(admins()).await.unwrap();
        assert_eq!(same.metadata.resource_version, 1);

        let mut edited = admins();
        edited.spec.enabled = false;
        let updated = store.apply(edited).await.unwrap();
        assert_eq!(updated.metadata.generation, 2);
        assert!(!updated.spec.enabled);

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_apply_never_writes_status() {
        let store = MemoryStore::<TestSpec>::new();
        let key = store.apply(admins()).await.unwrap().key();

        let status = ReconcileStatus {
            sync: true,
            original_object: "snapshot".into(),
            ..Default::default()
        };
        store.update_status(&key, status).await.unwrap();

        let mut edited = admins();
        edited.spec.enabled = false;
        edited.status = ReconcileStatus::default();
        let updated = store.apply(edited).await.unwrap();

        assert!(updated.status.sync);
        assert_eq!(updated.status.original_object, "snapshot");
    }

    #[tokio::test]
    async fn test_apply_version_mismatch() {
        let store = MemoryStore::<TestSpec>::new();
        store.apply(admins()).await.unwrap();

        let mut stale = admins();
        stale.spec.enabled = false;
        stale.metadata.resource_version = 42;
        let err = store.apply(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionMismatch { expected: 1, actual: 42, .. }));
    }

    #[tokio::test]
    async fn test_deletion_without_finalizer_removes() {
        let store = MemoryStore::<TestSpec>::new();
        let key = store.apply(admins()).await.unwrap().key();

        store.request_deletion(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deletion_waits_for_finalizer() {
        let store = MemoryStore::<TestSpec>::new();
        let key = store.apply(admins()).await.unwrap().key();
        store.add_finalizer(&key).await.unwrap();

        store.request_deletion(&key).await.unwrap();
        let pending = store.get(&key).await.unwrap().unwrap();
        assert!(pending.is_being_deleted());
        assert!(pending.has_finalizer());

        assert!(store.remove_finalizer(&key).await.unwrap().is_none());
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_finalizer_idempotent() {
        let store = MemoryStore::<TestSpec>::new();
        let key = store.apply(admins()).await.unwrap().key();

        store.add_finalizer(&key).await.unwrap();
        let res = store.add_finalizer(&key).await.unwrap();
        assert_eq!(res.metadata.finalizers, vec![FINALIZER.to_string()]);

        // Not being deleted: the resource stays
        assert!(store.remove_finalizer(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_resource() {
        let store = MemoryStore::<TestSpec>::new();
        let key = ResourceKey::new("default", "nope");

        assert!(store.get(&key).await.unwrap().is_none());
        assert!(matches!(
            store.request_deletion(&key).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update_status(&key, ReconcileStatus::default()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_sees_declarer_writes_only() {
        let store = MemoryStore::<TestSpec>::new();
        let mut events = store.subscribe();

        let key = store.apply(admins()).await.unwrap().key();
        assert_eq!(events.recv().await.unwrap(), key);

        store
            .update_status(&key, ReconcileStatus::default())
            .await
            .unwrap();
        store.add_finalizer(&key).await.unwrap();
        assert!(events.try_recv().is_err());

        store.request_deletion(&key).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), key);
    }
}
