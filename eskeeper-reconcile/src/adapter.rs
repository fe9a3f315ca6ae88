//! Per-resource-type adapter between a declared spec and its remote object.
//!
//! Adapters are thin mappings. All control flow lives in the reconciler.

use std::fmt::Debug;

use async_trait::async_trait;
use json_patch::Patch;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::diff::{self, three_way_patch};
use crate::error::Result;
use crate::resource::{Declared, ResourceSpec};

/// Maps one kind of declared resource onto the remote API.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    /// The declared spec type.
    type Spec: ResourceSpec;
    /// The remote object as the remote API reads and writes it.
    type Object: Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync;
    /// Per-pass connection to the remote system.
    type Handle: Send + Sync;

    /// Resource-specific condition type, e.g. `RoleMappingReady`.
    fn condition_type(&self) -> &'static str;

    /// Build the expected remote object from the declared resource.
    fn build(&self, resource: &Declared<Self::Spec>) -> Result<Self::Object>;

    /// Read the remote object, `None` if it does not exist.
    async fn get(&self, handle: &Self::Handle, name: &str) -> Result<Option<Self::Object>>;

    async fn create(
        &self,
        handle: &Self::Handle,
        name: &str,
        object: &Self::Object,
    ) -> Result<()>;

    async fn update(
        &self,
        handle: &Self::Handle,
        name: &str,
        object: &Self::Object,
    ) -> Result<()>;

    /// Delete the remote object. Deleting an absent object succeeds.
    async fn delete(&self, handle: &Self::Handle, name: &str) -> Result<()>;

    /// Patch from `current` to `expected`, given the last applied `original`.
    fn diff(
        &self,
        current: &Self::Object,
        expected: &Self::Object,
        original: Option<&Self::Object>,
    ) -> Result<Patch> {
        let (current, expected, original) = diff::values(current, expected, original)?;
        Ok(three_way_patch(&current, &expected, original.as_ref()))
    }
}
