//! Connection lookup for Elasticsearch clusters.
//!
//! Managed clusters are listed in a YAML registry file. Credentials live in a
//! secrets directory, one subdirectory per secret holding `username` and
//! `password` files. Both are read on every lookup so clusters and secrets
//! that appear later are picked up without a restart.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result as AnyResult};
use async_trait::async_trait;
use eskeeper_reconcile::{
    Connect, ConnectionDetails, ConnectionLookup, ConnectionRef, Credentials, HandleFactory,
    Lookup, ReconcileError, Result,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clients::{EsClient, EsError};

fn default_namespace() -> String {
    "default".to_string()
}

fn default_ready() -> bool {
    true
}

/// A cluster known to the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedCluster {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub addresses: Vec<String>,
    /// Secret with the credentials of the cluster's admin user.
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Whether the cluster has finished provisioning.
    #[serde(default = "default_ready")]
    pub ready: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    clusters: Vec<ManagedCluster>,
}

enum RegistrySource {
    File(PathBuf),
    Static(Vec<ManagedCluster>),
}

/// Registry of managed clusters.
pub struct ClusterRegistry {
    source: RegistrySource,
}

impl ClusterRegistry {
    /// Registry backed by a YAML file. A missing file is an empty registry.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: RegistrySource::File(path.into()),
        }
    }

    pub fn from_clusters(clusters: Vec<ManagedCluster>) -> Self {
        Self {
            source: RegistrySource::Static(clusters),
        }
    }

    /// Parse registry YAML.
    pub fn parse(yaml: &str) -> AnyResult<Vec<ManagedCluster>> {
        let file: RegistryFile =
            serde_yaml::from_str(yaml).context("Failed to parse cluster registry")?;
        Ok(file.clusters)
    }

    async fn clusters(&self) -> AnyResult<Vec<ManagedCluster>> {
        match &self.source {
            RegistrySource::Static(clusters) => Ok(clusters.clone()),
            RegistrySource::File(path) => match tokio::fs::read_to_string(path).await {
                Ok(yaml) => Self::parse(&yaml)
                    .with_context(|| format!("Invalid registry {}", path.display())),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
                Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
            },
        }
    }

    /// Find a cluster by namespace and name.
    pub async fn find(&self, namespace: &str, name: &str) -> AnyResult<Option<ManagedCluster>> {
        Ok(self
            .clusters()
            .await?
            .into_iter()
            .find(|c| c.namespace == namespace && c.name == name))
    }
}

/// Directory of credential secrets.
#[derive(Debug, Clone)]
pub struct SecretDir {
    root: PathBuf,
}

impl SecretDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether `name` stays inside the secrets directory.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && !name.contains('/') && name != "." && name != ".."
    }

    /// Read secret `name`. `None` if it or one of its files does not exist.
    pub async fn read(&self, name: &str) -> AnyResult<Option<Credentials>> {
        if !Self::is_valid_name(name) {
            anyhow::bail!("invalid secret name {:?}", name);
        }
        let dir = self.root.join(name);
        let Some(username) = read_trimmed(&dir.join("username")).await? else {
            return Ok(None);
        };
        let Some(password) = read_trimmed(&dir.join("password")).await? else {
            return Ok(None);
        };
        Ok(Some(Credentials { username, password }))
    }
}

async fn read_trimmed(path: &Path) -> AnyResult<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content.trim_end_matches(['\n', '\r']).to_string())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Resolves connection references against the registry and secrets.
#[derive(Clone)]
pub struct EsLookup {
    registry: Arc<ClusterRegistry>,
    secrets: SecretDir,
}

impl EsLookup {
    pub fn new(registry: Arc<ClusterRegistry>, secrets: SecretDir) -> Self {
        Self { registry, secrets }
    }

    /// `None` while the secret does not exist. Read failures are errors so a
    /// finalizer is never released on a transient I/O problem.
    async fn credentials(&self, secret: &str) -> Result<Option<Credentials>> {
        if !SecretDir::is_valid_name(secret) {
            return Err(ReconcileError::Config(format!(
                "invalid secret name {:?}",
                secret
            )));
        }
        self.secrets.read(secret).await.map_err(|e| {
            warn!("Failed to read secret {}: {:#}", secret, e);
            ReconcileError::remote(format!("reading secret {}", secret), e)
        })
    }
}

#[async_trait]
impl ConnectionLookup for EsLookup {
    async fn lookup(&self, namespace: &str, connection: &ConnectionRef) -> Result<Lookup> {
        if let Some(managed) = &connection.managed {
            let cluster_ns = managed.namespace.as_deref().unwrap_or(namespace);
            let cluster = match self.registry.find(cluster_ns, &managed.name).await {
                Ok(Some(cluster)) => cluster,
                Ok(None) => {
                    return Ok(Lookup::NotFound(format!(
                        "cluster {}/{} not found",
                        cluster_ns, managed.name
                    )));
                }
                Err(e) => {
                    warn!("Cluster registry unavailable: {:#}", e);
                    return Err(ReconcileError::remote("reading cluster registry", e));
                }
            };
            if !cluster.ready {
                return Ok(Lookup::NotReady(format!(
                    "cluster {}/{} not ready",
                    cluster_ns, cluster.name
                )));
            }
            let credentials = match &cluster.secret_ref {
                Some(secret) => match self.credentials(secret).await? {
                    Some(creds) => Some(creds),
                    None => return Ok(Lookup::NotFound(format!("secret {} not found", secret))),
                },
                None => None,
            };
            return Ok(Lookup::Ready(ConnectionDetails {
                addresses: cluster.addresses,
                credentials,
            }));
        }

        if let Some(external) = &connection.external {
            let Some(credentials) = self.credentials(&external.secret_ref).await? else {
                return Ok(Lookup::NotFound(format!(
                    "secret {} not found",
                    external.secret_ref
                )));
            };
            return Ok(Lookup::Ready(ConnectionDetails {
                addresses: external.addresses.clone(),
                credentials: Some(credentials),
            }));
        }

        Err(ReconcileError::Config(
            "connection needs a managed cluster name or external addresses".into(),
        ))
    }
}

/// Opens [`EsClient`] handles and checks that the cluster answers.
#[derive(Debug, Clone)]
pub struct EsHandleFactory {
    timeout: Duration,
}

impl EsHandleFactory {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HandleFactory for EsHandleFactory {
    type Handle = EsClient;

    async fn connect(&self, details: &ConnectionDetails) -> Result<Connect<EsClient>> {
        let client = EsClient::new(details, self.timeout)
            .map_err(|e| ReconcileError::remote("creating Elasticsearch client", e))?;

        match client.ping().await {
            Ok(()) => Ok(Connect::Connected(client)),
            Err(e) if e.is_unreachable() => {
                debug!("Elasticsearch at {:?} unreachable: {}", client.addresses(), e);
                Ok(Connect::Unreachable(e.to_string()))
            }
            // Reachable but refusing us, e.g. bad credentials
            Err(e @ EsError::Status { .. }) => {
                Err(ReconcileError::remote("connecting to Elasticsearch", e))
            }
            Err(e) => Ok(Connect::Unreachable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn write_secret(dir: &Path, name: &str, username: &str, password: &str) {
        let secret = dir.join(name);
        std::fs::create_dir_all(&secret).unwrap();
        std::fs::write(secret.join("username"), format!("{username}\n")).unwrap();
        std::fs::write(secret.join("password"), password).unwrap();
    }

    fn cluster(name: &str, ready: bool) -> ManagedCluster {
        ManagedCluster {
            name: name.to_string(),
            namespace: "default".to_string(),
            addresses: vec!["http://logging-es:9200".to_string()],
            secret_ref: Some("logging-es-elastic-user".to_string()),
            ready,
        }
    }

    fn lookup(clusters: Vec<ManagedCluster>, secrets: &TempDir) -> EsLookup {
        EsLookup::new(
            Arc::new(ClusterRegistry::from_clusters(clusters)),
            SecretDir::new(secrets.path()),
        )
    }

    // ========================================================================
    // Registry and secrets
    // ========================================================================

    #[test]
    fn test_parse_registry() {
        let clusters = ClusterRegistry::parse(
            r#"
clusters:
  - name: logging
    addresses: ["http://logging-es:9200"]
    secretRef: logging-es-elastic-user
  - name: metrics
    namespace: monitoring
    addresses: ["http://metrics-es:9200"]
    ready: false
"#,
        )
        .unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].namespace, "default");
        assert!(clusters[0].ready);
        assert_eq!(clusters[1].namespace, "monitoring");
        assert!(!clusters[1].ready);
        assert!(clusters[1].secret_ref.is_none());
    }

    #[tokio::test]
    async fn test_registry_file_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = ClusterRegistry::from_file(dir.path().join("clusters.yaml"));
        assert!(registry.find("default", "logging").await.unwrap().is_none());

        std::fs::write(
            dir.path().join("clusters.yaml"),
            "clusters:\n  - name: logging\n    addresses: [\"http://es:9200\"]\n",
        )
        .unwrap();
        assert!(registry.find("default", "logging").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_secret_dir_read() {
        let dir = TempDir::new().unwrap();
        write_secret(dir.path(), "es-creds", "elastic", "changeme");
        let secrets = SecretDir::new(dir.path());

        let creds = secrets.read("es-creds").await.unwrap().unwrap();
        assert_eq!(creds.username, "elastic");
        assert_eq!(creds.password, "changeme");

        assert!(secrets.read("missing").await.unwrap().is_none());
        assert!(secrets.read("../etc").await.is_err());
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    #[tokio::test]
    async fn test_managed_lookup_ready() {
        let dir = TempDir::new().unwrap();
        write_secret(dir.path(), "logging-es-elastic-user", "elastic", "pw");
        let lookup = lookup(vec![cluster("logging", true)], &dir);

        let result = lookup
            .lookup("default", &ConnectionRef::managed("logging"))
            .await
            .unwrap();
        match result {
            Lookup::Ready(details) => {
                assert_eq!(details.addresses, vec!["http://logging-es:9200"]);
                assert_eq!(details.credentials.unwrap().password, "pw");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_managed_lookup_missing_cluster_or_secret() {
        let dir = TempDir::new().unwrap();
        let lookup = lookup(vec![cluster("logging", true)], &dir);

        let missing_cluster = lookup
            .lookup("default", &ConnectionRef::managed("metrics"))
            .await
            .unwrap();
        assert!(matches!(missing_cluster, Lookup::NotFound(ref r) if r.contains("metrics")));

        // Other namespace than the cluster's
        let other_ns = lookup
            .lookup("team-a", &ConnectionRef::managed("logging"))
            .await
            .unwrap();
        assert!(matches!(other_ns, Lookup::NotFound(_)));

        let missing_secret = lookup
            .lookup("default", &ConnectionRef::managed("logging"))
            .await
            .unwrap();
        assert!(
            matches!(missing_secret, Lookup::NotFound(ref r) if r.contains("logging-es-elastic-user"))
        );
    }

    #[tokio::test]
    async fn test_managed_lookup_not_ready() {
        let dir = TempDir::new().unwrap();
        let lookup = lookup(vec![cluster("logging", false)], &dir);

        let result = lookup
            .lookup("default", &ConnectionRef::managed("logging"))
            .await
            .unwrap();
        assert!(matches!(result, Lookup::NotReady(_)));
    }

    #[tokio::test]
    async fn test_unreadable_registry_is_transient_error() {
        let dir = TempDir::new().unwrap();
        let registry_path = dir.path().join("clusters.yaml");
        std::fs::write(&registry_path, "clusters:\n  - name: [half written\n").unwrap();
        let lookup = EsLookup::new(
            Arc::new(ClusterRegistry::from_file(&registry_path)),
            SecretDir::new(dir.path()),
        );

        let err = lookup
            .lookup("default", &ConnectionRef::managed("logging"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Remote { .. }));
        assert!(!err.is_permanent());
        assert!(err.to_string().contains("cluster registry"), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_secret_name_is_config_error() {
        let dir = TempDir::new().unwrap();
        let lookup = lookup(vec![], &dir);
        let conn = ConnectionRef::external(&["http://es:9200"], "../etc");

        let err = lookup.lookup("default", &conn).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
    }

    #[tokio::test]
    async fn test_external_lookup() {
        let dir = TempDir::new().unwrap();
        let lookup = lookup(vec![], &dir);
        let conn = ConnectionRef::external(&["http://es:9200"], "es-creds");

        assert!(matches!(
            lookup.lookup("default", &conn).await.unwrap(),
            Lookup::NotFound(_)
        ));

        write_secret(dir.path(), "es-creds", "elastic", "changeme");
        match lookup.lookup("default", &conn).await.unwrap() {
            Lookup::Ready(details) => {
                assert_eq!(details.addresses, vec!["http://es:9200"]);
                assert_eq!(details.credentials.unwrap().username, "elastic");
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    // ========================================================================
    // Handle factory
    // ========================================================================

    #[tokio::test]
    async fn test_factory_connects_after_ping() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"cluster_name": "logging"})))
            .mount(&server)
            .await;

        let factory = EsHandleFactory::new(Duration::from_secs(5));
        let details = ConnectionDetails {
            addresses: vec![server.uri()],
            credentials: None,
        };
        assert!(matches!(
            factory.connect(&details).await.unwrap(),
            Connect::Connected(_)
        ));
    }

    #[tokio::test]
    async fn test_factory_unreachable() {
        let factory = EsHandleFactory::new(Duration::from_secs(5));
        let details = ConnectionDetails {
            addresses: vec!["http://127.0.0.1:1".into()],
            credentials: None,
        };
        assert!(matches!(
            factory.connect(&details).await.unwrap(),
            Connect::Unreachable(_)
        ));
    }

    #[tokio::test]
    async fn test_factory_rejected_credentials_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"type": "security_exception", "reason": "unable to authenticate user [elastic]"},
                "status": 401
            })))
            .mount(&server)
            .await;

        let factory = EsHandleFactory::new(Duration::from_secs(5));
        let details = ConnectionDetails {
            addresses: vec![server.uri()],
            credentials: None,
        };
        let err = factory.connect(&details).await.err().unwrap();
        assert!(err.to_string().contains("security_exception"));
    }
}
