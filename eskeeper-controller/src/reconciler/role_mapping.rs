//! Role mapping adapter - keeps `/_security/role_mapping/{name}` converged.

use std::collections::HashMap;

use async_trait::async_trait;
use eskeeper_reconcile::{Adapter, ConnectionRef, Declared, ReconcileError, ResourceSpec, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{es_error, parse_optional};
use crate::clients::EsClient;

fn default_enabled() -> bool {
    true
}

/// Declared role mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMappingSpec {
    /// Name of the role mapping in Elasticsearch. Defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Rules as a JSON document.
    pub rules: String,
    /// Metadata as a JSON document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    pub connection: ConnectionRef,
}

impl ResourceSpec for RoleMappingSpec {
    const KIND: &'static str = "RoleMapping";

    fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    fn external_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Role mapping as the security API reads and writes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub enabled: bool,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rules: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RoleMappingAdapter;

fn path(name: &str) -> String {
    format!("/_security/role_mapping/{}", name)
}

#[async_trait]
impl Adapter for RoleMappingAdapter {
    type Spec = RoleMappingSpec;
    type Object = RoleMapping;
    type Handle = EsClient;

    fn condition_type(&self) -> &'static str {
        "RoleMappingReady"
    }

    fn build(&self, resource: &Declared<RoleMappingSpec>) -> Result<RoleMapping> {
        let spec = &resource.spec;
        if spec.roles.is_empty() {
            return Err(ReconcileError::Config(
                "role mapping needs at least one role".into(),
            ));
        }
        Ok(RoleMapping {
            enabled: spec.enabled,
            roles: spec.roles.clone(),
            rules: ReconcileError::parse_embedded("rules", &spec.rules)?,
            metadata: parse_optional("metadata", spec.metadata.as_deref())?,
        })
    }

    async fn get(&self, es: &EsClient, name: &str) -> Result<Option<RoleMapping>> {
        let found: Option<HashMap<String, RoleMapping>> = es
            .get_json(&path(name))
            .await
            .map_err(|e| es_error("reading", "role mapping", name, e))?;
        Ok(found.and_then(|mut mappings| mappings.remove(name)))
    }

    async fn create(&self, es: &EsClient, name: &str, mapping: &RoleMapping) -> Result<()> {
        debug!("Creating role mapping {}", name);
        es.put_json(&path(name), mapping)
            .await
            .map_err(|e| es_error("creating", "role mapping", name, e))?;
        Ok(())
    }

    async fn update(&self, es: &EsClient, name: &str, mapping: &RoleMapping) -> Result<()> {
        debug!("Updating role mapping {}", name);
        es.put_json(&path(name), mapping)
            .await
            .map_err(|e| es_error("updating", "role mapping", name, e))?;
        Ok(())
    }

    async fn delete(&self, es: &EsClient, name: &str) -> Result<()> {
        es.delete(&path(name))
            .await
            .map_err(|e| es_error("deleting", "role mapping", name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::testing::client;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec() -> RoleMappingSpec {
        RoleMappingSpec {
            name: None,
            enabled: true,
            roles: vec!["superuser".into()],
            rules: r#"{"field": {"username": "*"}}"#.into(),
            metadata: None,
            connection: ConnectionRef::managed("logging"),
        }
    }

    #[test]
    fn test_build() {
        let mut spec = spec();
        spec.metadata = Some(r#"{"team": "ops"}"#.into());
        let res = Declared::new("default", "admins", spec);

        let mapping = RoleMappingAdapter.build(&res).unwrap();
        assert_eq!(
            serde_json::to_value(&mapping).unwrap(),
            json!({
                "enabled": true,
                "roles": ["superuser"],
                "rules": {"field": {"username": "*"}},
                "metadata": {"team": "ops"}
            })
        );
    }

    #[test]
    fn test_build_rejects_bad_rules() {
        let mut spec = spec();
        spec.rules = "{field".into();
        let err = RoleMappingAdapter
            .build(&Declared::new("default", "admins", spec))
            .unwrap_err();
        assert!(matches!(err, ReconcileError::EmbeddedDocument { ref field, .. } if field == "rules"));

        let mut spec = self::spec();
        spec.roles.clear();
        let err = RoleMappingAdapter
            .build(&Declared::new("default", "admins", spec))
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[test]
    fn test_spec_defaults() {
        let spec: RoleMappingSpec = serde_yaml::from_str(
            r#"
roles: [superuser]
rules: '{"field": {"username": "*"}}'
connection:
  managed:
    name: logging
"#,
        )
        .unwrap();
        assert!(spec.enabled);
        assert!(spec.metadata.is_none());
    }

    #[test]
    fn test_external_metadata_not_in_diff() {
        let res = Declared::new("default", "admins", spec());
        let expected = RoleMappingAdapter.build(&res).unwrap();
        let mut current = expected.clone();
        current.metadata = Some(json!({"owner": "ops"}));

        let patch = RoleMappingAdapter
            .diff(&current, &expected, Some(&expected))
            .unwrap();
        assert!(patch.0.is_empty());
    }

    #[tokio::test]
    async fn test_get_unwraps_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/_security/role_mapping/admins"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "admins": {
                    "enabled": true,
                    "roles": ["superuser"],
                    "rules": {"field": {"username": "*"}},
                    "metadata": {}
                }
            })))
            .mount(&server)
            .await;

        let mapping = RoleMappingAdapter
            .get(&client(&server), "admins")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.roles, vec!["superuser"]);
        assert_eq!(mapping.metadata, Some(json!({})));
    }

    #[tokio::test]
    async fn test_create_puts_document() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(url_path("/_security/role_mapping/admins"))
            .and(body_json(json!({
                "enabled": true,
                "roles": ["superuser"],
                "rules": {"field": {"username": "*"}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"role_mapping": {"created": true}})))
            .expect(1)
            .mount(&server)
            .await;

        let res = Declared::new("default", "admins", spec());
        let mapping = RoleMappingAdapter.build(&res).unwrap();
        RoleMappingAdapter
            .create(&client(&server), "admins", &mapping)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_error_is_remote() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/_security/role_mapping/admins"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "error": {"type": "exception", "reason": "boom"},
                "status": 500
            })))
            .mount(&server)
            .await;

        let err = RoleMappingAdapter
            .get(&client(&server), "admins")
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Remote { .. }));
        assert!(err.to_string().starts_with("reading role mapping admins"));
    }
}
