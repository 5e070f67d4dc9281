//! Webhook dispatcher
//!
//! Pushes newly acquired certificate material to the downstream proxy. One
//! delivery is in flight at a time and certificates are delivered in the
//! order they were acquired.

use certherd_common::CertificateRecord;
use certherd_config::WebhookConfig;
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::errors::WebhookError;

/// Sending half of the webhook queue
#[derive(Debug, Clone)]
pub struct WebhookQueue {
    tx: mpsc::UnboundedSender<CertificateRecord>,
}

impl WebhookQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CertificateRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a certificate for delivery
    pub fn enqueue(&self, record: CertificateRecord) -> bool {
        let subject = record.subject.clone();
        match self.tx.send(record) {
            Ok(()) => {
                debug!(subject = %subject, "Queued webhook delivery");
                true
            }
            Err(_) => {
                warn!(subject = %subject, "Webhook dispatcher stopped, dropping certificate");
                false
            }
        }
    }
}

/// Delivers certificates to the configured webhook destination
#[derive(Debug)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    method: Method,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Result<Self, WebhookError> {
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WebhookError::InvalidMethod(config.method.clone()))?;
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            method,
            config,
        })
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    /// Request body: private key, certificate and chain, each newline-terminated
    pub fn body(record: &CertificateRecord) -> String {
        format!(
            "{}\n{}\n{}\n",
            record.private_key, record.certificate, record.chain
        )
    }

    /// Issue one delivery request.
    ///
    /// Any non-2xx status is an error.
    pub async fn deliver(&self, record: &CertificateRecord) -> Result<StatusCode, WebhookError> {
        let url = self.config.url_for(&record.subject);
        debug!(subject = %record.subject, url = %url, method = %self.method, "Delivering certificate");

        let response = self
            .client
            .request(self.method.clone(), &url)
            .body(Self::body(record))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        info!(
            subject = %record.subject,
            status = status.as_u16(),
            response = %body,
            "Webhook responded"
        );

        if !status.is_success() {
            return Err(WebhookError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(status)
    }

    /// Deliver with the configured number of in-place retries.
    ///
    /// The `n`-th retry waits `n * retry_interval`.
    pub async fn deliver_with_retries(
        &self,
        record: &CertificateRecord,
    ) -> Result<StatusCode, WebhookError> {
        let mut attempt = 0;
        loop {
            match self.deliver(record).await {
                Ok(status) => return Ok(status),
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    let delay = self.config.retry_interval.saturating_mul(attempt);
                    warn!(
                        subject = %record.subject,
                        error = %e,
                        attempt = attempt,
                        retry_in_secs = delay.as_secs(),
                        "Webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver queued certificates one at a time until every sender is gone.
    pub async fn run(self, mut rx: mpsc::UnboundedReceiver<CertificateRecord>) {
        info!(
            url = %self.config.url_for(certherd_config::CERT_SUBJECT_PLACEHOLDER),
            method = %self.method,
            retries = self.config.retries,
            "Starting webhook dispatcher"
        );

        while let Some(record) = rx.recv().await {
            if let Err(e) = self.deliver_with_retries(&record).await {
                error!(
                    subject = %record.subject,
                    error = %e,
                    "Webhook delivery failed"
                );
            }
        }

        info!("Webhook dispatcher stopped");
    }
}
