//! Watch adapter - keeps `/_watcher/watch/{id}` converged.

use async_trait::async_trait;
use eskeeper_reconcile::{Adapter, ConnectionRef, Declared, ReconcileError, ResourceSpec, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{es_error, parse_optional};
use crate::clients::EsClient;

/// Declared watch. Every section is a JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    /// Watch id. Defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub trigger: String,
    pub input: String,
    pub condition: String,
    pub actions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    /// e.g. `15m`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_period: Option<String>,
    pub connection: ConnectionRef,
}

impl ResourceSpec for WatchSpec {
    const KIND: &'static str = "Watch";

    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn external_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Watch definition as the watcher API reads and writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub trigger: Value,
    pub input: Value,
    pub condition: Value,
    pub actions: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle_period: Option<String>,
}

/// GET response: `{"found": true, "_id": ..., "watch": {...}, "status": {...}}`.
#[derive(Deserialize)]
struct GetWatchResponse {
    #[serde(default)]
    found: bool,
    watch: Option<Watch>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WatchAdapter;

fn path(id: &str) -> String {
    format!("/_watcher/watch/{}", id)
}

#[async_trait]
impl Adapter for WatchAdapter {
    type Spec = WatchSpec;
    type Object = Watch;
    type Handle = EsClient;

    fn condition_type(&self) -> &'static str {
        "WatchReady"
    }

    fn build(&self, resource: &Declared<WatchSpec>) -> Result<Watch> {
        let spec = &resource.spec;
        Ok(Watch {
            trigger: ReconcileError::parse_embedded("trigger", &spec.trigger)?,
            input: ReconcileError::parse_embedded("input", &spec.input)?,
            condition: ReconcileError::parse_embedded("condition", &spec.condition)?,
            actions: ReconcileError::parse_embedded("actions", &spec.actions)?,
            transform: parse_optional("transform", spec.transform.as_deref())?,
            metadata: parse_optional("metadata", spec.metadata.as_deref())?,
            throttle_period: spec.throttle_period.clone().filter(|p| !p.is_empty()),
        })
    }

    async fn get(&self, es: &EsClient, id: &str) -> Result<Option<Watch>> {
        let found: Option<GetWatchResponse> = es
            .get_json(&path(id))
            .await
            .map_err(|e| es_error("reading", "watch", id, e))?;
        Ok(found.filter(|r| r.found).and_then(|r| r.watch))
    }

    async fn create(&self, es: &EsClient, id: &str, watch: &Watch) -> Result<()> {
        es.put_json(&path(id), watch)
            .await
            .map_err(|e| es_error("creating", "watch", id, e))?;
        Ok(())
    }

    async fn update(&self, es: &EsClient, id: &str, watch: &Watch) -> Result<()> {
        es.put_json(&path(id), watch)
            .await
            .map_err(|e| es_error("updating", "watch", id, e))?;
        Ok(())
    }

    async fn delete(&self, es: &EsClient, id: &str) -> Result<()> {
        es.delete(&path(id))
            .await
            .map_err(|e| es_error("deleting", "watch", id, e))
    }
}
