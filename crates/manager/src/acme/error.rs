//! ACME adapter error types.

use std::time::Duration;
use thiserror::Error;

/// Errors from the ACME client collaborator
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("account error: {0}")]
    Account(String),

    #[error("order creation failed: {0}")]
    OrderCreation(String),

    #[error("no HTTP-01 challenge offered for '{0}'")]
    NoHttp01Challenge(String),

    #[error("challenge validation failed: {0}")]
    ChallengeValidation(String),

    #[error("order finalization failed: {0}")]
    Finalization(String),

    #[error("timed out after {0:?} waiting for the issuer")]
    Timeout(Duration),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate parsing failed: {0}")]
    CertificateParse(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        AcmeError::OrderCreation(err.to_string())
    }
}

/// Errors from the on-disk certificate storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}
