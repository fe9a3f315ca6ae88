//! Reconcile driver.
//!
//! One pass runs Configure -> Read -> Diff -> Create/Update/Delete and then
//! records the outcome on the resource status:
//!
//! - Configure: add the finalizer and baseline condition, resolve a handle.
//!   A missing prerequisite ends the pass with a requeue, not an error.
//! - Read: build the expected object, fetch the current one, decode the
//!   snapshot of the last applied object.
//! - Diff: classify into no-op, create or update.
//! - Mutate: apply the action. The snapshot only moves after a successful
//!   create or update.
//! - Finalize: for resources marked for deletion, delete the remote object
//!   and release the finalizer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::adapter::Adapter;
use crate::condition::ReconcileStatus;
use crate::config::{ControllerConfig, DeletionPolicy};
use crate::diff::{self, Action};
use crate::error::{ReconcileError, Result};
use crate::events::EventRecorder;
use crate::resolver::{ConnectionLookup, HandleFactory, Resolution, Resolver};
use crate::resource::{Declared, ResourceKey, ResourceSpec};
use crate::snapshot;
use crate::store::ResourceStore;

/// When the resource should be looked at again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Wait for the next change.
    Done,
    /// The resource no longer exists; its key can be forgotten.
    Gone,
    After(Duration),
}

/// Trait for resource reconcilers driven by a controller.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Kind of resource this reconciler handles.
    fn kind(&self) -> &'static str;

    /// Run one pass for the resource behind `key`.
    async fn reconcile(&self, key: &ResourceKey) -> Result<Requeue>;
}

/// Result of trying to delete the remote object of a resource.
#[derive(Debug)]
pub enum DeletionOutcome {
    /// The remote object was deleted (or was already gone).
    Deleted,
    /// The remote system could not be reached; cleanup was skipped.
    SkippedUnreachable(String),
    /// The finalizer must stay; retry later.
    Failed(ReconcileError),
}

/// What a converging pass did to the remote object.
enum Applied {
    Created { snapshot: String },
    Updated { snapshot: String, change: String },
    Unchanged,
}

/// Generic reconciler for one adapter and its store.
pub struct ResourceReconciler<A, S, L, F> {
    adapter: A,
    store: Arc<S>,
    resolver: Resolver<L, F>,
    recorder: Arc<dyn EventRecorder>,
    config: ControllerConfig,
}

impl<A, S, L, F> ResourceReconciler<A, S, L, F>
where
    A: Adapter,
    S: ResourceStore<A::Spec> + 'static,
    L: ConnectionLookup + 'static,
    F: HandleFactory<Handle = A::Handle> + 'static,
{
    pub fn new(
        adapter: A,
        store: Arc<S>,
        lookup: L,
        factory: F,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        let resolver = Resolver::new(lookup, factory)
            .with_backoff(config.not_ready_backoff, config.deferred_backoff);
        Self {
            adapter,
            store,
            resolver,
            recorder,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn run_pass(&self, key: &ResourceKey) -> Result<Requeue> {
        let Some(resource) = self.store.get(key).await? else {
            debug!("{} {} is gone, nothing to do", A::Spec::KIND, key);
            return Ok(Requeue::Gone);
        };

        if resource.is_being_deleted() {
            if !resource.has_finalizer() {
                return Ok(Requeue::Done);
            }
            return self.finalize(&resource).await;
        }

        info!("Reconciling {} {}", A::Spec::KIND, key);

        // Configure
        let resource = if resource.has_finalizer() {
            resource
        } else {
            self.store.add_finalizer(key).await?
        };
        let mut status = resource.status.clone();
        status.ensure_initialized();

        let handle = match self
            .resolver
            .resolve(&resource.metadata.namespace, resource.spec.connection())
            .await
        {
            Ok(Resolution::Ready(handle)) => handle,
            Ok(Resolution::RetryAfter { after, reason }) => {
                info!(
                    "{} {} waiting for remote system ({}), retry in {:?}",
                    A::Spec::KIND,
                    key,
                    reason,
                    after
                );
                self.write_status(&resource, status).await?;
                return Ok(Requeue::After(after));
            }
            Err(e) => return self.on_error(&resource, status, e).await,
        };

        match self.converge(&resource, &handle).await {
            Ok(applied) => self.on_success(&resource, status, applied).await,
            Err(ReconcileError::Pending {
                reason,
                retry_after,
            }) => {
                info!(
                    "{} {} pending: {}, retry in {:?}",
                    A::Spec::KIND,
                    key,
                    reason,
                    retry_after
                );
                self.recorder
                    .normal(A::Spec::KIND, key, "Pending", &reason);
                self.write_status(&resource, status).await?;
                Ok(Requeue::After(retry_after))
            }
            Err(e) => self.on_error(&resource, status, e).await,
        }
    }

    /// Read, diff and mutate.
    async fn converge(&self, resource: &Declared<A::Spec>, handle: &A::Handle) -> Result<Applied> {
        let name = resource.target_name();

        let expected = self.adapter.build(resource)?;
        let current = self.adapter.get(handle, name).await?;
        let original: Option<A::Object> = snapshot::decode(&resource.status.original_object)?;

        let action = diff::classify(&self.adapter, current.as_ref(), expected, original.as_ref())?;
        debug!(
            "{} {}: {}",
            A::Spec::KIND,
            resource.key(),
            action.describe()
        );

        match action {
            Action::NoOp => Ok(Applied::Unchanged),
            Action::Create(expected) => {
                let snapshot = snapshot::encode(&expected)?;
                info!("Creating {} {} as {}", A::Spec::KIND, resource.key(), name);
                self.adapter.create(handle, name, &expected).await?;
                Ok(Applied::Created { snapshot })
            }
            Action::Update {
                expected,
                body,
                patch,
            } => {
                let snapshot = snapshot::encode(&expected)?;
                let change = diff::summarize(&patch);
                info!(
                    "Updating {} {} ({})",
                    A::Spec::KIND,
                    resource.key(),
                    change
                );
                self.adapter.update(handle, name, &body).await?;
                Ok(Applied::Updated { snapshot, change })
            }
        }
    }

    async fn on_success(
        &self,
        resource: &Declared<A::Spec>,
        mut status: ReconcileStatus,
        applied: Applied,
    ) -> Result<Requeue> {
        let key = resource.key();
        let condition = self.adapter.condition_type();

        match applied {
            Applied::Created { snapshot } => {
                status.original_object = snapshot;
                status.mark_success(condition, "Created", "successfully created", resource.metadata.generation);
                self.recorder.normal(
                    A::Spec::KIND,
                    &key,
                    "Created",
                    &format!("{} {} successfully created", A::Spec::KIND, resource.target_name()),
                );
            }
            Applied::Updated { snapshot, change } => {
                status.original_object = snapshot;
                status.mark_success(condition, "Updated", "successfully updated", resource.metadata.generation);
                self.recorder.normal(
                    A::Spec::KIND,
                    &key,
                    "Updated",
                    &format!(
                        "{} {} successfully updated: {}",
                        A::Spec::KIND,
                        resource.target_name(),
                        change
                    ),
                );
            }
            Applied::Unchanged => {
                status.mark_success(condition, "UpToDate", "already set", resource.metadata.generation);
            }
        }

        self.write_status(resource, status).await?;
        Ok(match self.config.resync_interval {
            Some(interval) => Requeue::After(interval),
            None => Requeue::Done,
        })
    }

    async fn on_error(
        &self,
        resource: &Declared<A::Spec>,
        mut status: ReconcileStatus,
        err: ReconcileError,
    ) -> Result<Requeue> {
        let key = resource.key();
        let message = err.to_string();
        error!("{} {} reconciliation failed: {}", A::Spec::KIND, key, message);

        status.mark_failure(self.adapter.condition_type(), &message);
        self.recorder
            .warning(A::Spec::KIND, &key, "Failed", &message);

        if let Err(store_err) = self.write_status(resource, status).await {
            warn!(
                "Failed to record failure on {} {}: {}",
                A::Spec::KIND,
                key,
                store_err
            );
        }
        Err(err)
    }

    /// Persist `status` if it differs from what is stored.
    async fn write_status(
        &self,
        resource: &Declared<A::Spec>,
        status: ReconcileStatus,
    ) -> Result<()> {
        if status != resource.status {
            self.store.update_status(&resource.key(), status).await?;
        }
        Ok(())
    }

    async fn finalize(&self, resource: &Declared<A::Spec>) -> Result<Requeue> {
        let key = resource.key();
        info!("Finalizing (deleting) {} {}", A::Spec::KIND, key);

        match self.delete_remote(resource).await {
            DeletionOutcome::Deleted => {
                self.recorder.normal(
                    A::Spec::KIND,
                    &key,
                    "Deleted",
                    &format!("{} {} successfully deleted", A::Spec::KIND, resource.target_name()),
                );
                self.release(&key).await
            }
            DeletionOutcome::SkippedUnreachable(reason) => {
                warn!(
                    "{} {}: remote system unreachable ({}), releasing without remote cleanup",
                    A::Spec::KIND,
                    key,
                    reason
                );
                self.recorder.warning(
                    A::Spec::KIND,
                    &key,
                    "DeleteSkipped",
                    &format!("remote system unreachable, remote object not deleted: {reason}"),
                );
                self.release(&key).await
            }
            DeletionOutcome::Failed(ReconcileError::Pending {
                reason,
                retry_after,
            }) => {
                info!(
                    "{} {} deletion waiting: {}, retry in {:?}",
                    A::Spec::KIND,
                    key,
                    reason,
                    retry_after
                );
                Ok(Requeue::After(retry_after))
            }
            DeletionOutcome::Failed(e) => {
                let status = resource.status.clone();
                self.on_error(resource, status, e).await
            }
        }
    }

    async fn release(&self, key: &ResourceKey) -> Result<Requeue> {
        match self.store.remove_finalizer(key).await? {
            None => Ok(Requeue::Gone),
            // Another finalizer still holds it
            Some(_) => Ok(Requeue::Done),
        }
    }

    async fn delete_remote(&self, resource: &Declared<A::Spec>) -> DeletionOutcome {
        let resolution = self
            .resolver
            .resolve(&resource.metadata.namespace, resource.spec.connection())
            .await;

        let handle = match (resolution, self.config.deletion_policy) {
            (Ok(Resolution::Ready(handle)), _) => handle,
            (Ok(Resolution::RetryAfter { reason, .. }), DeletionPolicy::ForceRemoveWhenUnreachable) => {
                return DeletionOutcome::SkippedUnreachable(reason);
            }
            (Ok(Resolution::RetryAfter { after, reason }), DeletionPolicy::RetainUntilReachable) => {
                return DeletionOutcome::Failed(ReconcileError::Pending {
                    reason,
                    retry_after: after,
                });
            }
            // A reference that can never resolve would hold the finalizer forever
            (Err(e), DeletionPolicy::ForceRemoveWhenUnreachable) if e.is_permanent() => {
                return DeletionOutcome::SkippedUnreachable(e.to_string());
            }
            (Err(e), _) => return DeletionOutcome::Failed(e),
        };

        match self.adapter.delete(&handle, resource.target_name()).await {
            Ok(()) => DeletionOutcome::Deleted,
            Err(e) => DeletionOutcome::Failed(e),
        }
    }
}

#[async_trait]
impl<A, S, L, F> Reconciler for ResourceReconciler<A, S, L, F>
where
    A: Adapter,
    S: ResourceStore<A::Spec> + 'static,
    L: ConnectionLookup + 'static,
    F: HandleFactory<Handle = A::Handle> + 'static,
{
    fn kind(&self) -> &'static str {
        A::Spec::KIND
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Requeue> {
        self.run_pass(key).await
    }
}
