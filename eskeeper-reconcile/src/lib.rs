//! Generic reconciliation of remote objects against declared resources.
//!
//! A declared resource names a remote system through a connection reference
//! and describes one object that should exist there. An [`Adapter`] maps the
//! declared spec onto the remote API; the [`ResourceReconciler`] drives the
//! converge and finalize flow for any adapter, and a [`Controller`] runs
//! reconcilers from a work queue.

pub mod adapter;
pub mod condition;
pub mod config;
pub mod controller;
pub mod diff;
pub mod error;
pub mod events;
pub mod reconciler;
pub mod resolver;
pub mod resource;
pub mod snapshot;
pub mod store;

pub use adapter::Adapter;
pub use condition::{Condition, ReconcileStatus};
pub use config::{ControllerConfig, DeletionPolicy};
pub use controller::Controller;
pub use diff::Action;
pub use error::{ReconcileError, Result};
pub use events::{Event, EventRecorder, EventType, MemoryRecorder, TracingRecorder};
pub use reconciler::{DeletionOutcome, Reconciler, Requeue, ResourceReconciler};
pub use resolver::{
    Connect, ConnectionDetails, ConnectionLookup, ConnectionRef, Credentials, ExternalRef,
    HandleFactory, Lookup, ManagedRef, Resolution, Resolver,
};
pub use resource::{Declared, FINALIZER, ObjectMeta, ResourceKey, ResourceSpec};
pub use store::{FileStore, MemoryStore, ResourceStore, StoreError};
