//! Reconciliation error types.

use std::time::Duration;

use thiserror::Error;

use crate::snapshot::CodecError;
use crate::store::StoreError;

/// Errors that can end a reconciliation pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The declared resource is misconfigured. Needs a spec edit to clear.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A spec field holding an embedded structured document failed to parse.
    #[error("invalid document in field `{field}`: {source}")]
    EmbeddedDocument {
        field: String,
        #[source]
        source: serde_json::Error,
    },

    /// The stored snapshot could not be encoded or decoded.
    #[error("snapshot: {0}")]
    Codec(#[from] CodecError),

    /// A call against the remote system failed.
    #[error("{context}: {source:#}")]
    Remote {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A prerequisite on the remote side is missing but expected to appear.
    #[error("{reason} (retry in {}s)", .retry_after.as_secs())]
    Pending {
        reason: String,
        retry_after: Duration,
    },

    /// Reading or writing the declared resource failed.
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl ReconcileError {
    /// Wrap a remote-system failure with a description of what was attempted.
    pub fn remote(context: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Remote {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Parse an embedded JSON document held in a spec field.
    pub fn parse_embedded<T: serde::de::DeserializeOwned>(
        field: &str,
        raw: &str,
    ) -> Result<T> {
        serde_json::from_str(raw).map_err(|source| Self::EmbeddedDocument {
            field: field.to_string(),
            source,
        })
    }

    /// Permanent errors only clear after the declared resource is edited.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::EmbeddedDocument { .. } | Self::Codec(_)
        )
    }
}

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;
