//! Resolution of a resource's connection reference into a live handle.
//!
//! A handle is only valid for the pass that resolved it. Missing
//! prerequisites are not errors: they come back as a retry delay.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReconcileError, Result};

/// Retry delay when the target cluster or its credentials do not exist yet.
pub const NOT_READY_BACKOFF: Duration = Duration::from_secs(30);
/// Retry delay when the cluster exists but a handle cannot be made yet.
pub const DEFERRED_BACKOFF: Duration = Duration::from_secs(60);

/// Points a declared resource at the remote system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRef {
    /// Cluster managed next to the declared resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed: Option<ManagedRef>,
    /// Cluster reachable at explicit addresses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<ExternalRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedRef {
    pub name: String,
    /// Defaults to the namespace of the declared resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalRef {
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Secret holding the username and password.
    #[serde(default)]
    pub secret_ref: String,
}

impl ConnectionRef {
    pub fn managed(name: &str) -> Self {
        Self {
            managed: Some(ManagedRef {
                name: name.to_string(),
                namespace: None,
            }),
            external: None,
        }
    }

    pub fn external(addresses: &[&str], secret_ref: &str) -> Self {
        Self {
            managed: None,
            external: Some(ExternalRef {
                addresses: addresses.iter().map(|a| a.to_string()).collect(),
                secret_ref: secret_ref.to_string(),
            }),
        }
    }

    /// Reject references that can never resolve.
    pub fn validate(&self) -> Result<()> {
        match (&self.managed, &self.external) {
            (Some(_), Some(_)) => Err(ReconcileError::Config(
                "connection must reference either a managed or an external cluster, not both"
                    .into(),
            )),
            (Some(managed), None) if managed.name.is_empty() => Err(ReconcileError::Config(
                "managed connection needs a cluster name".into(),
            )),
            (None, Some(external)) if external.addresses.is_empty() => Err(
                ReconcileError::Config("external connection needs at least one address".into()),
            ),
            (None, Some(external)) if external.secret_ref.is_empty() => Err(
                ReconcileError::Config("external connection needs a credential secret".into()),
            ),
            (None, None) => Err(ReconcileError::Config(
                "connection needs a managed cluster name or external addresses".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Username and password for the remote system.
#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to open a handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionDetails {
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
}

/// Outcome of looking up a connection reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Ready(ConnectionDetails),
    /// The referenced cluster or secret does not exist yet.
    NotFound(String),
    /// The cluster exists but is not ready to serve requests.
    NotReady(String),
}

/// Turns a connection reference into connection details.
#[async_trait]
pub trait ConnectionLookup: Send + Sync {
    async fn lookup(&self, namespace: &str, connection: &ConnectionRef) -> Result<Lookup>;
}

/// Outcome of opening a handle.
pub enum Connect<H> {
    Connected(H),
    Unreachable(String),
}

/// Opens handles to the remote system.
#[async_trait]
pub trait HandleFactory: Send + Sync {
    type Handle: Send + Sync;

    async fn connect(&self, details: &ConnectionDetails) -> Result<Connect<Self::Handle>>;
}

/// Outcome of resolving a handle for one pass.
pub enum Resolution<H> {
    Ready(H),
    RetryAfter { after: Duration, reason: String },
}

impl<H> Resolution<H> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Resolution::Ready(_))
    }
}

impl<H> fmt::Debug for Resolution<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Ready(_) => f.write_str("Ready"),
            Resolution::RetryAfter { after, reason } => f
                .debug_struct("RetryAfter")
                .field("after", after)
                .field("reason", reason)
                .finish(),
        }
    }
}

/// Resolves connection references into handles.
pub struct Resolver<L, F> {
    lookup: L,
    factory: F,
    not_ready_backoff: Duration,
    deferred_backoff: Duration,
}

impl<L, F> Resolver<L, F>
where
    L: ConnectionLookup,
    F: HandleFactory,
{
    pub fn new(lookup: L, factory: F) -> Self {
        Self {
            lookup,
            factory,
            not_ready_backoff: NOT_READY_BACKOFF,
            deferred_backoff: DEFERRED_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, not_ready: Duration, deferred: Duration) -> Self {
        self.not_ready_backoff = not_ready;
        self.deferred_backoff = deferred;
        self
    }

    /// Resolve a handle. Never touches persisted state.
    pub async fn resolve(
        &self,
        namespace: &str,
        connection: &ConnectionRef,
    ) -> Result<Resolution<F::Handle>> {
        connection.validate()?;

        let details = match self.lookup.lookup(namespace, connection).await? {
            Lookup::Ready(details) => details,
            Lookup::NotFound(reason) => {
                debug!("Connection not available yet: {}", reason);
                return Ok(Resolution::RetryAfter {
                    after: self.not_ready_backoff,
                    reason,
                });
            }
            Lookup::NotReady(reason) => {
                debug!("Connection deferred: {}", reason);
                return Ok(Resolution::RetryAfter {
                    after: self.deferred_backoff,
                    reason,
                });
            }
        };

        match self.factory.connect(&details).await? {
            Connect::Connected(handle) => Ok(Resolution::Ready(handle)),
            Connect::Unreachable(reason) => {
                debug!("Remote system unreachable: {}", reason);
                Ok(Resolution::RetryAfter {
                    after: self.deferred_backoff,
                    reason,
                })
            }
        }
    }
}
