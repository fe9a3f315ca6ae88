//! Resource store persisted as JSON files.
//!
//! Layout is `<dir>/<namespace>/<name>.json`, one file per resource holding
//! metadata, spec and status. Reads are served from memory; every write goes
//! to disk before it returns, through a temporary file and a rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use super::{MemoryStore, ResourceStore, Result, StoreError};
use crate::condition::ReconcileStatus;
use crate::resource::{Declared, ResourceKey, ResourceSpec};

fn storage(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Storage {
        path: path.display().to_string(),
        source,
    }
}

fn valid_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\', '\0'])
}

/// Resource store that survives restarts.
pub struct FileStore<S> {
    memory: MemoryStore<S>,
    dir: PathBuf,
    /// Serializes file writes so the last write always reflects the latest state.
    write_lock: Mutex<()>,
}

impl<S: ResourceSpec> FileStore<S> {
    /// Open the store in `dir`, loading every persisted resource.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage(&dir, e))?;

        let resources = Self::scan(&dir).await?;
        info!(
            "Loaded {} {} resources from {}",
            resources.len(),
            S::KIND,
            dir.display()
        );

        Ok(Self {
            memory: MemoryStore::with_resources(resources),
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Subscribe to keys of resources changed by the declarer.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceKey> {
        self.memory.subscribe()
    }

    async fn scan(dir: &Path) -> Result<Vec<Declared<S>>> {
        let mut resources = Vec::new();
        let mut namespaces = fs::read_dir(dir).await.map_err(|e| storage(dir, e))?;

        while let Some(namespace) = namespaces.next_entry().await.map_err(|e| storage(dir, e))? {
            let ns_dir = namespace.path();
            if !namespace
                .file_type()
                .await
                .map_err(|e| storage(&ns_dir, e))?
                .is_dir()
            {
                continue;
            }

            let mut files = fs::read_dir(&ns_dir).await.map_err(|e| storage(&ns_dir, e))?;
            while let Some(file) = files.next_entry().await.map_err(|e| storage(&ns_dir, e))? {
                let path = file.path();
                if path.extension().is_none_or(|ext| ext != "json") {
                    continue;
                }
                let content = fs::read(&path).await.map_err(|e| storage(&path, e))?;
                let resource: Declared<S> = serde_json::from_slice(&content).map_err(|e| {
                    StoreError::Internal(format!("corrupt resource file {}: {}", path.display(), e))
                })?;
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    fn path(&self, key: &ResourceKey) -> PathBuf {
        self.dir
            .join(&key.namespace)
            .join(format!("{}.json", key.name))
    }

    /// Write the current state of `key` to disk, or remove its file when the
    /// resource is gone.
    async fn persist(&self, key: &ResourceKey) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.path(key);

        let Some(resource) = self.memory.get(key).await? else {
            return match fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed {}", path.display());
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(storage(&path, e)),
            };
        };

        let json = serde_json::to_vec_pretty(&resource)
            .map_err(|e| StoreError::Internal(format!("serializing {}: {}", key, e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| storage(parent, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).await.map_err(|e| storage(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| storage(&path, e))?;
        Ok(())
    }
}

#[async_trait]
impl<S: ResourceSpec> ResourceStore<S> for FileStore<S> {
    async fn get(&self, key: &ResourceKey) -> Result<Option<Declared<S>>> {
        self.memory.get(key).await
    }

    async fn list(&self) -> Result<Vec<Declared<S>>> {
        self.memory.list().await
    }

    async fn apply(&self, resource: Declared<S>) -> Result<Declared<S>> {
        let key = resource.key();
        for part in [&key.namespace, &key.name] {
            if !valid_component(part) {
                return Err(StoreError::InvalidName(part.clone()));
            }
        }
        let stored = self.memory.apply(resource).await?;
        self.persist(&key).await?;
        Ok(stored)
    }

    async fn request_deletion(&self, key: &ResourceKey) -> Result<()> {
        self.memory.request_deletion(key).await?;
        self.persist(key).await
    }

    async fn update_status(
        &self,
        key: &ResourceKey,
        status: ReconcileStatus,
    ) -> Result<Declared<S>> {
        let updated = self.memory.update_status(key, status).await?;
        self.persist(key).await?;
        Ok(updated)
    }

    async fn add_finalizer(&self, key: &ResourceKey) -> Result<Declared<S>> {
        let updated = self.memory.add_finalizer(key).await?;
        self.persist(key).await?;
        Ok(updated)
    }

    async fn remove_finalizer(&self, key: &ResourceKey) -> Result<Option<Declared<S>>> {
        let updated = self.memory.remove_finalizer(key).await?;
        self.persist(key).await?;
        Ok(updated)
    }
}
