//! Docker Engine API service source.
//!
//! Lists swarm services filtered by the domains label
//! (`GET /services?filters={"label":["<label>"]}`) and reads the domains and
//! email labels from each service spec.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use certherd_config::DockerEndpoint;
use http::{header, Method, Request};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixStream;
use tracing::{debug, trace, warn};

use super::{DiscoveredService, ServiceSource};
use crate::errors::DiscoveryError;

/// Deadline of one service listing unless configured otherwise
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ServiceJson {
    #[serde(rename = "Spec", default)]
    spec: Option<ServiceSpecJson>,
}

#[derive(Debug, Deserialize)]
struct ServiceSpecJson {
    #[serde(rename = "Labels", default)]
    labels: Option<HashMap<String, String>>,
}

/// Service source backed by the Docker Engine API
#[derive(Debug, Clone)]
pub struct DockerServiceSource {
    endpoint: DockerEndpoint,
    domains_label: String,
    email_label: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl DockerServiceSource {
    pub fn new(
        endpoint: DockerEndpoint,
        domains_label: impl Into<String>,
        email_label: impl Into<String>,
    ) -> Self {
        Self {
            endpoint,
            domains_label: domains_label.into(),
            email_label: email_label.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            http: http_client(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Bound every listing, connection and body included, by `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self.http = http_client(timeout);
        self
    }

    /// Request path and query of the service listing
    fn services_path(&self) -> String {
        let filters = serde_json::json!({ "label": [self.domains_label] }).to_string();
        format!("/services?filters={}", urlencoding::encode(&filters))
    }

    async fn fetch(&self) -> Result<(u16, Bytes), DiscoveryError> {
        tokio::time::timeout(self.timeout, self.request())
            .await
            .map_err(|_| {
                DiscoveryError::Connection(format!(
                    "Docker engine did not answer within {:?}",
                    self.timeout
                ))
            })?
    }

    async fn request(&self) -> Result<(u16, Bytes), DiscoveryError> {
        let path = self.services_path();
        match &self.endpoint {
            DockerEndpoint::Unix(socket) => fetch_unix(socket, &path).await,
            DockerEndpoint::Http(base) => {
                let url = format!("{}{}", base, path);
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| DiscoveryError::Connection(e.to_string()))?;
                let status = response.status().as_u16();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| DiscoveryError::Connection(e.to_string()))?;
                Ok((status, body))
            }
        }
    }

    /// Extract labelled services from a listing body
    fn parse(&self, body: &[u8]) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        let services: Vec<ServiceJson> = serde_json::from_slice(body)
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

        Ok(services
            .into_iter()
            .filter_map(|service| {
                let mut labels = service.spec?.labels?;
                let label = labels.remove(&self.domains_label)?;
                if label.trim().is_empty() {
                    return None;
                }
                let email = labels.remove(&self.email_label);
                Some(DiscoveredService { label, email })
            })
            .collect())
    }
}

#[async_trait]
impl ServiceSource for DockerServiceSource {
    async fn list(&self) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        let (status, body) = self.fetch().await?;
        if !(200..300).contains(&status) {
            return Err(DiscoveryError::Status {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let services = self.parse(&body)?;
        debug!(services = services.len(), "Listed labelled services");
        Ok(services)
    }
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to a Docker HTTP client without timeout");
            reqwest::Client::new()
        })
}

/// GET `path` from the engine over a unix socket
async fn fetch_unix(socket: &Path, path: &str) -> Result<(u16, Bytes), DiscoveryError> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        DiscoveryError::Connection(format!("{}: {}", socket.display(), e))
    })?;

    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| DiscoveryError::Connection(e.to_string()))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            trace!(error = %e, "Docker socket connection closed");
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::HOST, "docker")
        .body(Empty::<Bytes>::new())
        .map_err(|e| DiscoveryError::Connection(e.to_string()))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| DiscoveryError::Connection(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| DiscoveryError::Connection(e.to_string()))?
        .to_bytes();

    Ok((status, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const DOMAINS_LABEL: &str = "com.df.letsencrypt.host";
    const EMAIL_LABEL: &str = "com.df.letsencrypt.email";

    fn listing() -> serde_json::Value {
        serde_json::json!([
            {
                "ID": "1",
                "Spec": {
                    "Name": "web",
                    "Labels": {
                        DOMAINS_LABEL: "a.example.com,b.example.com",
                        EMAIL_LABEL: "ops@example.com"
                    }
                }
            },
            {
                "ID": "2",
                "Spec": { "Name": "api", "Labels": { DOMAINS_LABEL: "api.example.com" } }
            },
            { "ID": "3", "Spec": { "Name": "db", "Labels": {} } },
            { "ID": "4", "Spec": { "Name": "cache", "Labels": null } }
        ])
    }

    fn source(endpoint: DockerEndpoint) -> DockerServiceSource {
        DockerServiceSource::new(endpoint, DOMAINS_LABEL, EMAIL_LABEL)
    }

    #[test]
    fn test_services_path_encodes_filter() {
        let source = source(DockerEndpoint::Http("http://docker".to_string()));
        assert_eq!(
            source.services_path(),
            "/services?filters=%7B%22label%22%3A%5B%22com.df.letsencrypt.host%22%5D%7D"
        );
    }

    #[test]
    fn test_parse_extracts_labels() {
        let source = source(DockerEndpoint::Http("http://docker".to_string()));
        let services = source.parse(listing().to_string().as_bytes()).unwrap();

        assert_eq!(
            services,
            vec![
                DiscoveredService::new(
                    "a.example.com,b.example.com",
                    Some("ops@example.com".to_string())
                ),
                DiscoveredService::new("api.example.com", None),
            ]
        );
    }

    #[test]
    fn test_parse_rejects_non_array() {
        let source = source(DockerEndpoint::Http("http://docker".to_string()));
        assert!(matches!(
            source.parse(br#"{"message":"nope"}"#),
            Err(DiscoveryError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_list_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/services"))
            .and(query_param("filters", r#"{"label":["com.df.letsencrypt.host"]}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing()))
            .expect(1)
            .mount(&server)
            .await;

        let services = source(DockerEndpoint::Http(server.uri()))
            .list()
            .await
            .unwrap();
        assert_eq!(services.len(), 2);
    }

    #[tokio::test]
    async fn test_list_reports_engine_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(503).set_body_string("This node is not a swarm manager"),
            )
            .mount(&server)
            .await;

        let err = source(DockerEndpoint::Http(server.uri()))
            .list()
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn test_list_over_unix_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let body = listing().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            assert!(request.starts_with(b"GET /services?filters="));
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
        });

        let services = source(DockerEndpoint::Unix(socket)).list().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[1].label, "api.example.com");
    }

    #[tokio::test]
    async fn test_silent_engine_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("docker.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();

        // Accept, then never answer
        let held = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let source = source(DockerEndpoint::Unix(socket)).with_timeout(Duration::from_millis(200));
        let result = tokio::time::timeout(Duration::from_secs(5), source.list())
            .await
            .expect("listing must give up on its own");

        match result {
            Err(DiscoveryError::Connection(message)) => {
                assert!(message.contains("did not answer"), "{message}")
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
        held.abort();
    }

    #[tokio::test]
    async fn test_silent_http_engine_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let err = source(DockerEndpoint::Http(server.uri()))
            .with_timeout(Duration::from_millis(200))
            .list()
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Connection(_)));
    }

    #[tokio::test]
    async fn test_missing_socket_is_connection_error() {
        let err = source(DockerEndpoint::Unix(PathBuf::from("/nonexistent/docker.sock")))
            .list()
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Connection(_)));
    }
}
