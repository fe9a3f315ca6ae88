//! Persistence of declared resources.
//!
//! The store separates the two writers of a resource: the declarer owns spec
//! and metadata (`apply`, `request_deletion`), the reconciler owns status and
//! its finalizer (`update_status`, `add_finalizer`, `remove_finalizer`).

mod error;
mod file;
mod memory;

pub use error::{Result, StoreError};
pub use file::FileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::condition::ReconcileStatus;
use crate::resource::{Declared, ResourceKey, ResourceSpec};

/// Store trait for one kind of declared resource.
#[async_trait]
pub trait ResourceStore<S: ResourceSpec>: Send + Sync {
    /// Get a resource by key.
    async fn get(&self, key: &ResourceKey) -> Result<Option<Declared<S>>>;

    /// List all resources.
    async fn list(&self) -> Result<Vec<Declared<S>>>;

    /// Create or replace spec and metadata. Any status on `resource` is ignored.
    async fn apply(&self, resource: Declared<S>) -> Result<Declared<S>>;

    /// Mark a resource for deletion. Removed right away if no finalizer holds it.
    async fn request_deletion(&self, key: &ResourceKey) -> Result<()>;

    /// Replace the status of a resource.
    async fn update_status(
        &self,
        key: &ResourceKey,
        status: ReconcileStatus,
    ) -> Result<Declared<S>>;

    /// Add the reconciler finalizer.
    async fn add_finalizer(&self, key: &ResourceKey) -> Result<Declared<S>>;

    /// Drop the reconciler finalizer. Returns `None` when that released a
    /// resource marked for deletion.
    async fn remove_finalizer(&self, key: &ResourceKey) -> Result<Option<Declared<S>>>;
}
