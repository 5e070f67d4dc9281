//! ACME client collaborator interface.

use std::fmt;

use async_trait::async_trait;
use certherd_common::CertificateRecord;

use super::error::AcmeError;

/// Issuer environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Environment {
    /// Non-production endpoint, no rate-limit cost
    Staging,
    /// Production endpoint, issues trusted certificates
    Production,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Staging => f.write_str("staging"),
            Environment::Production => f.write_str("production"),
        }
    }
}

/// Parameters of one issuance request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueRequest {
    /// Subject Alternative Names, the first one is the subject
    pub hostnames: Vec<String>,
    /// Contact email of the issuer account
    pub contact_email: String,
    /// RSA modulus size of the certificate key
    pub rsa_key_size: u32,
}

/// Certificate issuance against one issuer environment.
///
/// Implementations own account handling, the HTTP-01 order flow (publishing
/// key authorizations where the challenge server can find them) and
/// certificate persistence.
///
/// # Preconditions
///
/// `issue` and `renew` only succeed when the challenge server is reachable
/// from the issuer on port 80 of every requested hostname for the duration
/// of the call.
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Environment this client talks to
    fn environment(&self) -> Environment;

    /// Stored certificate covering all `hostnames`, if any
    async fn check(&self, hostnames: &[String]) -> Result<Option<CertificateRecord>, AcmeError>;

    /// Issue a new certificate
    async fn issue(&self, request: &IssueRequest) -> Result<CertificateRecord, AcmeError>;

    /// Replace a certificate that is close to expiry
    async fn renew(
        &self,
        request: &IssueRequest,
        current: &CertificateRecord,
    ) -> Result<CertificateRecord, AcmeError>;
}
