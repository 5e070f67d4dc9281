//! HTTP-01 challenge server
//!
//! Answers `/.well-known/acme-challenge/<token>` from the staging store
//! first, then the production store. Clients only ever see 200 with the key
//! authorization or 404 with a JSON error body.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use certherd_common::normalize_host;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

use crate::acme::{ChallengeManager, ChallengeStore};

/// Error message for unknown paths
pub const NOT_FOUND_MESSAGE: &str = "Not found";

/// Error message for unknown or unreadable tokens
pub const TOKEN_NOT_FOUND_MESSAGE: &str =
    "Error: These aren't the tokens you're looking for. Move along.";

/// Pause after a failed `accept()`
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json; charset=utf-8";

/// Response to one challenge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

impl ChallengeResponse {
    fn secret(key_authorization: String) -> Self {
        Self {
            status: StatusCode::OK,
            content_type: TEXT_PLAIN,
            body: key_authorization,
        }
    }

    fn not_found(message: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            content_type: APPLICATION_JSON,
            body: serde_json::json!({ "error": { "message": message } }).to_string(),
        }
    }

    fn into_http(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(self.content_type),
        );
        response
    }
}

/// Resolves challenge requests against the staging and production stores
pub struct ChallengeResponder {
    staging: Arc<dyn ChallengeStore>,
    production: Arc<dyn ChallengeStore>,
}

impl ChallengeResponder {
    pub fn new(staging: Arc<dyn ChallengeStore>, production: Arc<dyn ChallengeStore>) -> Self {
        Self {
            staging,
            production,
        }
    }

    /// Responder over the two in-process challenge managers
    pub fn from_managers(staging: ChallengeManager, production: ChallengeManager) -> Self {
        Self::new(Arc::new(staging), Arc::new(production))
    }

    /// Answer a request for `path` on `host`.
    ///
    /// The request method is not considered. A lookup error ends the
    /// request with 404 without consulting the next store.
    pub async fn respond(&self, path: &str, host: Option<&str>) -> ChallengeResponse {
        let Some(token) = ChallengeManager::extract_token(path) else {
            trace!(path = %path, "Not a challenge path");
            return ChallengeResponse::not_found(NOT_FOUND_MESSAGE);
        };
        let hostname = host.map(normalize_host).unwrap_or_default();

        if token.is_empty() || hostname.is_empty() {
            debug!(hostname = %hostname, "Challenge request without token or host");
            return ChallengeResponse::not_found(TOKEN_NOT_FOUND_MESSAGE);
        }

        for (environment, store) in [("staging", &self.staging), ("production", &self.production)]
        {
            match store.lookup(&hostname, token).await {
                Ok(Some(key_authorization)) => {
                    info!(
                        hostname = %hostname,
                        token = %token,
                        environment = environment,
                        "Serving ACME challenge"
                    );
                    return ChallengeResponse::secret(key_authorization);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        hostname = %hostname,
                        token = %token,
                        environment = environment,
                        error = %e,
                        "Challenge lookup failed"
                    );
                    return ChallengeResponse::not_found(TOKEN_NOT_FOUND_MESSAGE);
                }
            }
        }

        debug!(hostname = %hostname, token = %token, "Unknown challenge token");
        ChallengeResponse::not_found(TOKEN_NOT_FOUND_MESSAGE)
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| request.uri().host());

        trace!(method = %request.method(), path = %request.uri().path(), host = ?host, "Request");
        self.respond(request.uri().path(), host).await.into_http()
    }
}

impl std::fmt::Debug for ChallengeResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeResponder").finish_non_exhaustive()
    }
}

/// Plain HTTP server in front of a [`ChallengeResponder`]
#[derive(Debug)]
pub struct ChallengeServer {
    listener: TcpListener,
    responder: Arc<ChallengeResponder>,
}

impl ChallengeServer {
    /// Bind the listening socket
    pub async fn bind(addr: SocketAddr, responder: ChallengeResponder) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            responder: Arc::new(responder),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self) {
        match self.listener.local_addr() {
            Ok(addr) => info!(address = %addr, "Challenge server listening"),
            Err(e) => warn!(error = %e, "Challenge server listening on unknown address"),
        }

        loop {
            let (stream, peer) = accept_with_backoff(|| self.listener.accept()).await;

            let responder = self.responder.clone();
            tokio::spawn(async move {
                let service = service_fn(move |request| {
                    let responder = responder.clone();
                    async move { Ok::<_, Infallible>(responder.handle(request).await) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(peer = %peer, error = %e, "Connection error");
                }
            });
        }
    }
}

/// Retry `accept` until it yields a connection, pausing after each error.
/// Errors like EMFILE persist until connections close.
async fn accept_with_backoff<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}
