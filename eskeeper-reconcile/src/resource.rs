//! Declared resource model.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::condition::ReconcileStatus;
use crate::resolver::ConnectionRef;

/// Finalizer token that blocks removal until remote cleanup ran.
pub const FINALIZER: &str = "eskeeper.io/finalizer";

fn default_namespace() -> String {
    "default".to_string()
}

/// Metadata common to every declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Bumped by the store whenever the spec changes.
    #[serde(default)]
    pub generation: i64,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            generation: 0,
            resource_version: 0,
            finalizers: Vec::new(),
            deletion_timestamp: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Namespaced name identifying a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Per-type part of a declared resource.
pub trait ResourceSpec:
    fmt::Debug + Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Kind name used in manifests, logs and events.
    const KIND: &'static str;

    /// Where the remote system lives.
    fn connection(&self) -> &ConnectionRef;

    /// Explicit remote name, when it differs from the resource name.
    fn external_name(&self) -> Option<&str> {
        None
    }
}

/// A declared resource: metadata, desired spec and reconciler-owned status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Declared<S> {
    pub metadata: ObjectMeta,
    pub spec: S,
    #[serde(default)]
    pub status: ReconcileStatus,
}

impl<S: ResourceSpec> Declared<S> {
    pub fn new(namespace: &str, name: &str, spec: S) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ReconcileStatus::default(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Name of the remote object.
    pub fn target_name(&self) -> &str {
        self.spec
            .external_name()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.metadata.name)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata.finalizers.iter().any(|f| f == FINALIZER)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal spec used across the engine tests.

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestSpec {
        #[serde(default)]
        pub name: Option<String>,
        pub enabled: bool,
        pub roles: Vec<String>,
        pub connection: ConnectionRef,
    }

    impl ResourceSpec for TestSpec {
        const KIND: &'static str = "TestMapping";

        fn connection(&self) -> &ConnectionRef {
            &self.connection
        }

        fn external_name(&self) -> Option<&str> {
            self.name.as_deref()
        }
    }

    pub fn external_connection() -> ConnectionRef {
        ConnectionRef::external(&["http://es:9200"], "es-creds")
    }

    pub fn spec(roles: &[&str]) -> TestSpec {
        TestSpec {
            name: None,
            enabled: true,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            connection: external_connection(),
        }
    }
}
