//! Error types of the lifecycle engine.

use std::time::Duration;

use thiserror::Error;

use crate::acme::AcmeError;

/// Orchestrator service listing failed
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("connection to container engine failed: {0}")]
    Connection(String),

    #[error("container engine returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid service list: {0}")]
    InvalidResponse(String),
}

/// One acquisition attempt failed
///
/// Every variant drives the retry/backoff state machine.
#[derive(Error, Debug)]
pub enum AcquisitionError {
    /// Staging pre-control failed; production was not contacted
    #[error("staging validation failed for {hostnames}: {source}")]
    Validation {
        hostnames: String,
        #[source]
        source: AcmeError,
    },

    #[error("production issuance failed for {hostnames}: {source}")]
    Issuance {
        hostnames: String,
        #[source]
        source: AcmeError,
    },

    #[error("production renewal failed for {hostnames}: {source}")]
    Renewal {
        hostnames: String,
        #[source]
        source: AcmeError,
    },

    #[error("acquisition timed out after {0:?}")]
    Timeout(Duration),
}

impl AcquisitionError {
    /// Short kind name for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionError::Validation { .. } => "validation",
            AcquisitionError::Issuance { .. } => "issuance",
            AcquisitionError::Renewal { .. } => "renewal",
            AcquisitionError::Timeout(_) => "timeout",
        }
    }
}

/// Challenge secret lookup failed
///
/// Never shown to HTTP clients; the challenge server answers 404.
#[derive(Error, Debug)]
#[error("challenge lookup failed: {0}")]
pub struct ChallengeLookupError(pub String);

/// Webhook delivery failed
#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid webhook method '{0}'")]
    InvalidMethod(String),
}
