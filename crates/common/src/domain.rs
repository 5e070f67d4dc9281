//! Domain sets: the unit of certificate management.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::DomainKey;

/// Characters separating hostnames inside a discovery label.
pub const HOSTNAME_SEPARATORS: [char; 2] = [',', ';'];

/// Errors building a domain set from discovery metadata
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("label '{0}' contains no hostnames")]
    NoHostnames(String),

    #[error("no contact email for label '{0}'")]
    MissingEmail(String),
}

/// A group of hostnames issued as one certificate.
///
/// All hostnames of one discovery label become the Subject Alternative
/// Names of a single certificate; the first hostname is the certificate
/// subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSet {
    /// Discovery label value, unique in the registry
    pub key: DomainKey,
    /// Ordered, de-duplicated hostnames (never empty)
    pub hostnames: Vec<String>,
    /// Contact email for the issuer account
    pub contact_email: String,
    /// Failed attempts since the last success
    pub retry_count: u32,
}

impl DomainSet {
    /// Build a domain set from a raw label value and contact email.
    pub fn from_label(label: &str, contact_email: &str) -> Result<Self, DomainError> {
        let hostnames = parse_hostnames(label);
        if hostnames.is_empty() {
            return Err(DomainError::NoHostnames(label.to_string()));
        }

        let contact_email = contact_email.trim();
        if contact_email.is_empty() {
            return Err(DomainError::MissingEmail(label.to_string()));
        }

        Ok(Self {
            key: DomainKey::new(label),
            hostnames,
            contact_email: contact_email.to_string(),
            retry_count: 0,
        })
    }

    /// The certificate subject (first hostname)
    pub fn primary_hostname(&self) -> &str {
        // from_label guarantees at least one hostname
        self.hostnames.first().map(String::as_str).unwrap_or_default()
    }
}

/// Split a discovery label into hostnames.
///
/// Pieces are separated by `,` or `;`, trimmed and lower-cased. Empty
/// pieces are dropped and duplicates keep their first position.
pub fn parse_hostnames(label: &str) -> Vec<String> {
    let mut hostnames: Vec<String> = Vec::new();
    for piece in label.split(HOSTNAME_SEPARATORS) {
        let hostname = piece.trim().to_ascii_lowercase();
        if hostname.is_empty() || hostnames.contains(&hostname) {
            continue;
        }
        hostnames.push(hostname);
    }
    hostnames
}

/// Normalize an HTTP `Host` header into a bare hostname.
///
/// Lower-cases the value and strips any port. Bracketed IPv6 literals keep
/// their brackets.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let bare = if host.starts_with('[') {
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        host.split(':').next().unwrap_or_default()
    };
    bare.to_ascii_lowercase()
}
