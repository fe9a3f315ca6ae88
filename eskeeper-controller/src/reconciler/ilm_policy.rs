//! Index lifecycle policy adapter - keeps `/_ilm/policy/{name}` converged.

use std::collections::HashMap;

use async_trait::async_trait;
use eskeeper_reconcile::{Adapter, ConnectionRef, Declared, ReconcileError, ResourceSpec, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::es_error;
use crate::clients::EsClient;

/// Declared index lifecycle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecyclePolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Policy body (`phases`, `_meta`) as a JSON document.
    pub policy: String,
    pub connection: ConnectionRef,
}

impl ResourceSpec for LifecyclePolicySpec {
    const KIND: &'static str = "LifecyclePolicy";

    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn external_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// ILM policy document, `{"policy": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecyclePolicy {
    pub policy: Value,
}

/// Entry of a GET response; version and dates are ignored.
#[derive(Deserialize)]
struct PolicyEntry {
    policy: Value,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LifecyclePolicyAdapter;

fn path(name: &str) -> String {
    format!("/_ilm/policy/{}", name)
}

#[async_trait]
impl Adapter for LifecyclePolicyAdapter {
    type Spec = LifecyclePolicySpec;
    type Object = LifecyclePolicy;
    type Handle = EsClient;

    fn condition_type(&self) -> &'static str {
        "LifecyclePolicyReady"
    }

    fn build(&self, resource: &Declared<LifecyclePolicySpec>) -> Result<LifecyclePolicy> {
        let policy: Value = ReconcileError::parse_embedded("policy", &resource.spec.policy)?;
        if !policy.is_object() {
            return Err(ReconcileError::Config(
                "policy must be a JSON object".into(),
            ));
        }
        Ok(LifecyclePolicy { policy })
    }

    async fn get(&self, es: &EsClient, name: &str) -> Result<Option<LifecyclePolicy>> {
        let found: Option<HashMap<String, PolicyEntry>> = es
            .get_json(&path(name))
            .await
            .map_err(|e| es_error("reading", "lifecycle policy", name, e))?;
        Ok(found
            .and_then(|mut policies| policies.remove(name))
            .map(|entry| LifecyclePolicy {
                policy: entry.policy,
            }))
    }

    async fn create(&self, es: &EsClient, name: &str, policy: &LifecyclePolicy) -> Result<()> {
        es.put_json(&path(name), policy)
            .await
            .map_err(|e| es_error("creating", "lifecycle policy", name, e))?;
        Ok(())
    }

    async fn update(&self, es: &EsClient, name: &str, policy: &LifecyclePolicy) -> Result<()> {
        es.put_json(&path(name), policy)
            .await
            .map_err(|e| es_error("updating", "lifecycle policy", name, e))?;
        Ok(())
    }

    async fn delete(&self, es: &EsClient, name: &str) -> Result<()> {
        es.delete(&path(name))
            .await
            .map_err(|e| es_error("deleting", "lifecycle policy", name, e))
    }
}
