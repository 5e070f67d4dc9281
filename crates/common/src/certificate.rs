//! Issued certificate material.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Result of a successful acquisition or renewal.
///
/// Immutable once produced. The manager hands it to the webhook dispatcher
/// exactly once and then drops it; persistence belongs to the ACME client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Primary hostname, used as storage and webhook key
    pub subject: String,
    /// All hostnames covered by the certificate
    pub hostnames: Vec<String>,
    /// PEM-encoded private key
    pub private_key: String,
    /// PEM-encoded leaf certificate
    pub certificate: String,
    /// PEM-encoded issuer chain (may be empty)
    pub chain: String,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl CertificateRecord {
    /// Time left until expiry, negative once expired.
    pub fn remaining_validity(&self, now: DateTime<Utc>) -> Duration {
        self.not_after - now
    }

    /// Whether the certificate expires within `renew_before_days` of `now`.
    pub fn needs_renewal(&self, renew_before_days: u32, now: DateTime<Utc>) -> bool {
        self.remaining_validity(now) < Duration::days(i64::from(renew_before_days))
    }

    /// Whether every hostname in `hostnames` is covered by this certificate.
    pub fn covers(&self, hostnames: &[String]) -> bool {
        hostnames.iter().all(|h| self.hostnames.contains(h))
    }
}

// Private key material stays out of logs.
impl std::fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("subject", &self.subject)
            .field("hostnames", &self.hostnames)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}
