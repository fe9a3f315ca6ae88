//! Snapshot lifecycle policy adapter - keeps `/_slm/policy/{name}` converged.
//!
//! A policy can only be written once its snapshot repository exists. A
//! missing repository is reported as pending, not as a failure.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use eskeeper_reconcile::{Adapter, ConnectionRef, Declared, ReconcileError, ResourceSpec, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{es_error, parse_optional};
use crate::clients::{EsClient, EsError};

/// Retry delay while the snapshot repository is missing.
pub const REPOSITORY_RETRY: Duration = Duration::from_secs(30);

/// Declared snapshot lifecycle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotLifecyclePolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Cron schedule, e.g. `0 30 1 * * ?`.
    pub schedule: String,
    /// Name pattern of the snapshots taken, e.g. `<nightly-{now/d}>`.
    pub snapshot_name: String,
    pub repository: String,
    /// Snapshot configuration (indices, partial, ...) as a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
    pub connection: ConnectionRef,
}

impl ResourceSpec for SnapshotLifecyclePolicySpec {
    const KIND: &'static str = "SnapshotLifecyclePolicy";

    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn external_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Snapshot retention rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Retention {
    #[serde(default, alias = "expireAfter", skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<String>,
    #[serde(default, alias = "minCount", skip_serializing_if = "Option::is_none")]
    pub min_count: Option<u32>,
    #[serde(default, alias = "maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<u32>,
}

/// SLM policy as the API reads and writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotLifecyclePolicy {
    pub schedule: String,
    /// Snapshot name pattern.
    pub name: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention: Option<Retention>,
}

#[derive(Deserialize)]
struct PolicyEntry {
    policy: SnapshotLifecyclePolicy,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SnapshotLifecyclePolicyAdapter;

fn path(name: &str) -> String {
    format!("/_slm/policy/{}", name)
}

/// Elasticsearch refused the policy because its repository is missing.
fn is_missing_repository(err: &EsError) -> bool {
    match err {
        EsError::Status {
            error_type, reason, ..
        } => {
            error_type == "repository_missing_exception"
                || (error_type == "illegal_argument_exception"
                    && reason.contains("no such repository"))
        }
        _ => false,
    }
}

fn repository_pending(repository: &str) -> ReconcileError {
    ReconcileError::Pending {
        reason: format!("snapshot repository {} not found", repository),
        retry_after: REPOSITORY_RETRY,
    }
}

impl SnapshotLifecyclePolicyAdapter {
    async fn ensure_repository(&self, es: &EsClient, repository: &str) -> Result<()> {
        let found: Option<Value> = es
            .get_json(&format!("/_snapshot/{}", repository))
            .await
            .map_err(|e| es_error("reading", "snapshot repository", repository, e))?;
        if found.is_none() {
            info!("Snapshot repository {} does not exist yet", repository);
            return Err(repository_pending(repository));
        }
        Ok(())
    }

    async fn put(
        &self,
        es: &EsClient,
        action: &str,
        name: &str,
        policy: &SnapshotLifecyclePolicy,
    ) -> Result<()> {
        self.ensure_repository(es, &policy.repository).await?;
        match es.put_json(&path(name), policy).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing_repository(&e) => Err(repository_pending(&policy.repository)),
            Err(e) => Err(es_error(action, "snapshot lifecycle policy", name, e)),
        }
    }
}

#[async_trait]
impl Adapter for SnapshotLifecyclePolicyAdapter {
    type Spec = SnapshotLifecyclePolicySpec;
    type Object = SnapshotLifecyclePolicy;
    type Handle = EsClient;

    fn condition_type(&self) -> &'static str {
        "SnapshotLifecyclePolicyReady"
    }

    fn build(&self, resource: &Declared<SnapshotLifecyclePolicySpec>) -> Result<SnapshotLifecyclePolicy> {
        let spec = &resource.spec;
        for (field, value) in [
            ("schedule", &spec.schedule),
            ("snapshotName", &spec.snapshot_name),
            ("repository", &spec.repository),
        ] {
            if value.trim().is_empty() {
                return Err(ReconcileError::Config(format!("{} must not be empty", field)));
            }
        }
        Ok(SnapshotLifecyclePolicy {
            schedule: spec.schedule.clone(),
            name: spec.snapshot_name.clone(),
            repository: spec.repository.clone(),
            config: parse_optional("config", spec.config.as_deref())?,
            retention: spec.retention.clone(),
        })
    }

    async fn get(&self, es: &EsClient, name: &str) -> Result<Option<SnapshotLifecyclePolicy>> {
        let found: Option<HashMap<String, PolicyEntry>> = es
            .get_json(&path(name))
            .await
            .map_err(|e| es_error("reading", "snapshot lifecycle policy", name, e))?;
        Ok(found
            .and_then(|mut policies| policies.remove(name))
            .map(|entry| entry.policy))
    }

    async fn create(&self, es: &EsClient, name: &str, policy: &SnapshotLifecyclePolicy) -> Result<()> {
        self.put(es, "creating", name, policy).await
    }

    async fn update(&self, es: &EsClient, name: &str, policy: &SnapshotLifecyclePolicy) -> Result<()> {
        self.put(es, "updating", name, policy).await
    }

    async fn delete(&self, es: &EsClient, name: &str) -> Result<()> {
        es.delete(&path(name))
            .await
            .map_err(|e| es_error("deleting", "snapshot lifecycle policy", name, e))
    }
}
