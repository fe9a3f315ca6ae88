//! Adapters mapping declared resources onto Elasticsearch APIs.
//!
//! Each adapter builds the expected remote object from its spec and reads,
//! writes and deletes it through an [`EsClient`](crate::clients::EsClient).
//! The generic reconciler in `eskeeper_reconcile` drives them.

pub mod ilm_policy;
pub mod role_mapping;
pub mod slm_policy;
pub mod watch;

pub use ilm_policy::{LifecyclePolicyAdapter, LifecyclePolicySpec};
pub use role_mapping::{RoleMappingAdapter, RoleMappingSpec};
pub use slm_policy::{SnapshotLifecyclePolicyAdapter, SnapshotLifecyclePolicySpec};
pub use watch::{WatchAdapter, WatchSpec};

use eskeeper_reconcile::{ReconcileError, Result};
use serde_json::Value;

use crate::clients::EsError;

/// Parse an optional embedded JSON document. Blank text counts as absent.
fn parse_optional(field: &str, raw: Option<&str>) -> Result<Option<Value>> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => ReconcileError::parse_embedded(field, raw).map(Some),
        _ => Ok(None),
    }
}

/// Wrap a client error with what was being done to which object.
fn es_error(action: &str, kind: &str, name: &str, err: EsError) -> ReconcileError {
    ReconcileError::remote(format!("{} {} {}", action, kind, name), err)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_optional() {
        assert_eq!(parse_optional("metadata", None).unwrap(), None);
        assert_eq!(parse_optional("metadata", Some("  ")).unwrap(), None);
        assert_eq!(
            parse_optional("metadata", Some(r#"{"team":"ops"}"#)).unwrap(),
            Some(serde_json::json!({"team": "ops"}))
        );

        let err = parse_optional("metadata", Some("{team")).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("metadata"));
    }
}
