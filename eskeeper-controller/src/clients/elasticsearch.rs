//! Client for the Elasticsearch REST API.

use std::time::Duration;

use eskeeper_reconcile::{ConnectionDetails, Credentials};
use reqwest::{Method, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors returned by [`EsClient`].
#[derive(Debug, Error)]
pub enum EsError {
    #[error("no Elasticsearch address configured")]
    NoAddress,

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Non-success response, with the `error.type` and `error.reason` of the body.
    #[error("HTTP {status}: {error_type}: {reason}")]
    Status {
        status: u16,
        error_type: String,
        reason: String,
    },

    #[error("invalid response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EsError {
    /// Elasticsearch error type, e.g. `resource_not_found_exception`.
    pub fn error_type(&self) -> Option<&str> {
        match self {
            EsError::Status { error_type, .. } => Some(error_type),
            _ => None,
        }
    }

    /// True when the server could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, EsError::Http { .. } | EsError::NoAddress)
    }
}

pub type Result<T> = std::result::Result<T, EsError>;

/// Client for one Elasticsearch cluster.
///
/// Addresses are tried in order; the next one is only used when a
/// connection cannot be established.
#[derive(Clone)]
pub struct EsClient {
    http: reqwest::Client,
    addresses: Vec<String>,
    credentials: Option<Credentials>,
}

impl EsClient {
    pub fn new(details: &ConnectionDetails, timeout: Duration) -> Result<Self> {
        if details.addresses.is_empty() {
            return Err(EsError::NoAddress);
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EsError::Client)?;
        Ok(Self {
            http,
            addresses: details
                .addresses
                .iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            credentials: details.credentials.clone(),
        })
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Check that the cluster answers and accepts the credentials.
    pub async fn ping(&self) -> Result<()> {
        let response = self.send(Method::GET, "/", None).await?;
        check(response).await.map(|_| ())
    }

    /// GET a JSON document. A 404 is `None`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(Method::GET, path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = check(response).await?;
        serde_json::from_str(&body)
            .map(Some)
            .map_err(|source| EsError::Decode {
                path: path.to_string(),
                source,
            })
    }

    /// PUT a JSON document and return the response body.
    pub async fn put_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        let body = serde_json::to_value(body).map_err(|source| EsError::Decode {
            path: path.to_string(),
            source,
        })?;
        let response = self.send(Method::PUT, path, Some(&body)).await?;
        let text = check(response).await?;
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|source| EsError::Decode {
            path: path.to_string(),
            source,
        })
    }

    /// DELETE a document. A 404 counts as deleted.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let response = self.send(Method::DELETE, path, None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("{} already gone", path);
            return Ok(());
        }
        check(response).await.map(|_| ())
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Response> {
        let mut last_err = EsError::NoAddress;
        for address in &self.addresses {
            let url = format!("{}{}", address, path);
            debug!("{} {}", method, url);

            let mut request = self.http.request(method.clone(), &url);
            if let Some(creds) = &self.credentials {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(source) if source.is_connect() => {
                    debug!("{} unreachable: {}", address, source);
                    last_err = EsError::Http { url, source };
                }
                Err(source) => return Err(EsError::Http { url, source }),
            }
        }
        Err(last_err)
    }
}

/// Body of a successful response, or the parsed error.
async fn check(response: Response) -> Result<String> {
    let status = response.status();
    let url = response.url().to_string();
    let body = response
        .text()
        .await
        .map_err(|source| EsError::Http { url, source })?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(status_error(status, &body))
    }
}

fn status_error(status: StatusCode, body: &str) -> EsError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error"));

    let (error_type, reason) = match error {
        Some(Value::Object(error)) => (
            error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            error
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        Some(Value::String(reason)) => ("unknown".to_string(), reason.clone()),
        _ => (
            status
                .canonical_reason()
                .unwrap_or("unknown")
                .to_lowercase()
                .replace(' ', "_"),
            body.chars().take(200).collect(),
        ),
    };

    EsError::Status {
        status: status.as_u16(),
        error_type,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{basic_auth, body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(addresses: Vec<String>) -> EsClient {
        EsClient::new(
            &ConnectionDetails {
                addresses,
                credentials: Some(Credentials {
                    username: "elastic".into(),
                    password: "changeme".into(),
                }),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_status_error_parses_body() {
        let err = status_error(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"type":"illegal_argument_exception","reason":"no such repository"},"status":400}"#,
        );
        assert_eq!(err.error_type(), Some("illegal_argument_exception"));
        assert_eq!(
            err.to_string(),
            "HTTP 400: illegal_argument_exception: no such repository"
        );

        let err = status_error(StatusCode::UNAUTHORIZED, "");
        assert_eq!(err.error_type(), Some("unauthorized"));
    }

    #[test]
    fn test_new_requires_address() {
        let err = EsClient::new(
            &ConnectionDetails {
                addresses: vec![],
                credentials: None,
            },
            Duration::from_secs(5),
        )
        .err()
        .unwrap();
        assert!(matches!(err, EsError::NoAddress));
    }

    #[tokio::test]
    async fn test_get_json_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_ilm/policy/logs"))
            .and(basic_auth("elastic", "changeme"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"logs": {"version": 1}})))
            .mount(&server)
            .await;

        let es = client(vec![format!("{}/", server.uri())]);
        let doc: Option<Value> = es.get_json("/_ilm/policy/logs").await.unwrap();
        assert_eq!(doc.unwrap()["logs"]["version"], 1);
    }

    #[tokio::test]
    async fn test_get_json_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_security/role_mapping/nope"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({})))
            .mount(&server)
            .await;

        let es = client(vec![server.uri()]);
        let doc: Option<Value> = es.get_json("/_security/role_mapping/nope").await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn test_put_json_sends_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_ilm/policy/logs"))
            .and(body_json(json!({"policy": {"phases": {}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&server)
            .await;

        let es = client(vec![server.uri()]);
        let resp = es
            .put_json("/_ilm/policy/logs", &json!({"policy": {"phases": {}}}))
            .await
            .unwrap();
        assert_eq!(resp["acknowledged"], true);
    }

    #[tokio::test]
    async fn test_put_json_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_slm/policy/nightly"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": {"type": "illegal_argument_exception", "reason": "no such repository [backups]"},
                "status": 400
            })))
            .mount(&server)
            .await;

        let es = client(vec![server.uri()]);
        let err = es
            .put_json("/_slm/policy/nightly", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::Status { status: 400, .. }));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_delete_not_found_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/_watcher/watch/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&server)
            .await;

        let es = client(vec![server.uri()]);
        es.delete("/_watcher/watch/gone").await.unwrap();
    }

    #[tokio::test]
    async fn test_falls_back_to_next_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tagline": "You Know, for Search"})))
            .mount(&server)
            .await;

        // Nothing listens on port 1
        let es = client(vec!["http://127.0.0.1:1".into(), server.uri()]);
        es.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_unreachable() {
        let es = client(vec!["http://127.0.0.1:1".into()]);
        let err = es.ping().await.unwrap_err();
        assert!(err.is_unreachable());
    }
}
