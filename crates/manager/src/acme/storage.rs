//! On-disk state of one issuer environment
//!
//! Staging and production each get their own root so that their accounts
//! and certificates never mix.
//!
//! ```text
//! <root>/
//! ├── accounts/<email>.json   serialized instant-acme credentials
//! └── domains/<subject>/
//!     ├── cert.pem            leaf
//!     ├── chain.pem           issuer chain
//!     ├── key.pem             private key (0600)
//!     └── meta.json           expiry, issue date, SANs
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use certherd_common::CertificateRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::error::StorageError;

const ACCOUNTS_DIR: &str = "accounts";
const DOMAINS_DIR: &str = "domains";
const LEAF_FILE: &str = "cert.pem";
const CHAIN_FILE: &str = "chain.pem";
const KEY_FILE: &str = "key.pem";
const META_FILE: &str = "meta.json";

/// Facts about a stored certificate kept next to its PEM files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateMeta {
    pub expires: DateTime<Utc>,
    pub issued: DateTime<Utc>,
    /// Every hostname in the SAN list
    pub domains: Vec<String>,
    /// Directory URL that issued it
    #[serde(default)]
    pub issuer: Option<String>,
}

/// PEM material plus metadata as read from or written to disk
#[derive(Debug, Clone)]
pub struct StoredCertificate {
    pub cert_pem: String,
    pub chain_pem: String,
    pub key_pem: String,
    pub meta: CertificateMeta,
}

impl StoredCertificate {
    /// Convert into the record handed to the webhook.
    pub fn into_record(self, subject: &str) -> CertificateRecord {
        CertificateRecord {
            subject: subject.to_string(),
            hostnames: self.meta.domains,
            private_key: self.key_pem,
            certificate: self.cert_pem,
            chain: self.chain_pem,
            not_after: self.meta.expires,
        }
    }
}

/// Filesystem store for ACME accounts and issued certificates
#[derive(Debug)]
pub struct CertificateStorage {
    root: PathBuf,
}

impl CertificateStorage {
    /// Open the store rooted at `root`, creating its directories owner-only
    /// when missing.
    pub fn new(root: &Path) -> Result<Self, StorageError> {
        let accounts = root.join(ACCOUNTS_DIR);
        let domains = root.join(DOMAINS_DIR);
        for dir in [&accounts, &domains] {
            fs::create_dir_all(dir)?;
        }
        for dir in [root, accounts.as_path(), domains.as_path()] {
            restrict(dir, 0o700)?;
        }

        info!(root = %root.display(), "Opened certificate storage");
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.root
    }

    fn account_file(&self, email: &str) -> Result<PathBuf, StorageError> {
        let name = format!("{}.json", checked_key(email)?);
        Ok(self.root.join(ACCOUNTS_DIR).join(name))
    }

    fn subject_dir(&self, subject: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(DOMAINS_DIR).join(checked_key(subject)?))
    }

    /// Serialized account credentials for `email`, if an account was
    /// registered before
    pub fn load_credentials_json(&self, email: &str) -> Result<Option<String>, StorageError> {
        let file = self.account_file(email)?;
        match read_optional(&file)? {
            Some(json) => {
                debug!(email = %email, "Reusing stored ACME account");
                Ok(Some(json))
            }
            None => {
                trace!(email = %email, "No ACME account on disk");
                Ok(None)
            }
        }
    }

    pub fn save_credentials_json(&self, email: &str, json: &str) -> Result<(), StorageError> {
        let file = self.account_file(email)?;
        fs::write(&file, json)?;
        restrict(&file, 0o600)?;
        info!(email = %email, "Stored ACME account");
        Ok(())
    }

    /// Certificate stored under `subject`, `None` when nothing was issued
    /// yet. A missing chain file reads as an empty chain.
    pub fn load_certificate(&self, subject: &str) -> Result<Option<StoredCertificate>, StorageError> {
        let dir = self.subject_dir(subject)?;
        let Some(cert_pem) = read_optional(&dir.join(LEAF_FILE))? else {
            trace!(subject = %subject, "No certificate on disk");
            return Ok(None);
        };

        let key_pem = fs::read_to_string(dir.join(KEY_FILE))?;
        let chain_pem = read_optional(&dir.join(CHAIN_FILE))?.unwrap_or_default();
        let meta: CertificateMeta = serde_json::from_str(&fs::read_to_string(dir.join(META_FILE))?)?;

        debug!(subject = %subject, expires = %meta.expires, "Read certificate from disk");
        Ok(Some(StoredCertificate {
            cert_pem,
            chain_pem,
            key_pem,
            meta,
        }))
    }

    pub fn save_certificate(
        &self,
        subject: &str,
        certificate: &StoredCertificate,
    ) -> Result<(), StorageError> {
        let dir = self.subject_dir(subject)?;
        fs::create_dir_all(&dir)?;

        let key_file = dir.join(KEY_FILE);
        fs::write(&key_file, &certificate.key_pem)?;
        restrict(&key_file, 0o600)?;
        fs::write(dir.join(LEAF_FILE), &certificate.cert_pem)?;
        fs::write(dir.join(CHAIN_FILE), &certificate.chain_pem)?;
        fs::write(
            dir.join(META_FILE),
            serde_json::to_string_pretty(&certificate.meta)?,
        )?;

        info!(
            subject = %subject,
            expires = %certificate.meta.expires,
            "Wrote certificate to disk"
        );
        Ok(())
    }
}

fn read_optional(path: &Path) -> Result<Option<String>, StorageError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn restrict(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}

/// Reject keys that would escape their directory
fn checked_key(key: &str) -> Result<&str, StorageError> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, CertificateStorage) {
        let dir = TempDir::new().unwrap();
        let storage = CertificateStorage::new(dir.path()).unwrap();
        (dir, storage)
    }

    fn pem(label: &str, body: &str) -> String {
        format!("-----BEGIN {label}-----\n{body}\n-----END {label}-----")
    }

    fn issued_for(hostnames: &[&str], valid_days: i64) -> StoredCertificate {
        StoredCertificate {
            cert_pem: pem("CERTIFICATE", "leaf"),
            chain_pem: pem("CERTIFICATE", "chain"),
            key_pem: pem("PRIVATE KEY", "key"),
            meta: CertificateMeta {
                expires: Utc::now() + chrono::Duration::days(valid_days),
                issued: Utc::now(),
                domains: hostnames.iter().map(|h| h.to_string()).collect(),
                issuer: None,
            },
        }
    }

    #[test]
    fn opening_creates_layout() {
        let (_dir, storage) = open();
        assert!(storage.base_path().join(DOMAINS_DIR).is_dir());
        assert!(storage.base_path().join(ACCOUNTS_DIR).is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn private_key_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let (_dir, storage) = open();
        storage
            .save_certificate("a.example.com", &issued_for(&["a.example.com"], 90))
            .unwrap();

        let key = storage
            .base_path()
            .join(DOMAINS_DIR)
            .join("a.example.com")
            .join(KEY_FILE);
        let mode = fs::metadata(key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn accounts_are_keyed_by_email() {
        let (_dir, storage) = open();
        storage
            .save_credentials_json("ops@example.com", r#"{"id": "ops"}"#)
            .unwrap();

        assert_eq!(
            storage.load_credentials_json("ops@example.com").unwrap(),
            Some(r#"{"id": "ops"}"#.to_string())
        );
        assert_eq!(storage.load_credentials_json("dev@example.com").unwrap(), None);
    }

    #[test]
    fn stored_certificate_reads_back_as_record() {
        let (_dir, storage) = open();
        let written = issued_for(&["a.example.com", "b.example.com"], 90);
        storage.save_certificate("a.example.com", &written).unwrap();

        let read = storage.load_certificate("a.example.com").unwrap().unwrap();
        assert_eq!(read.cert_pem, written.cert_pem);
        assert_eq!(read.chain_pem, written.chain_pem);
        assert_eq!(read.key_pem, written.key_pem);

        let record = read.into_record("a.example.com");
        assert_eq!(record.subject, "a.example.com");
        assert_eq!(record.hostnames, vec!["a.example.com", "b.example.com"]);
        assert!(record.covers(&["b.example.com".to_string()]));
    }

    #[test]
    fn missing_chain_reads_as_empty() {
        let (_dir, storage) = open();
        storage
            .save_certificate("a.example.com", &issued_for(&["a.example.com"], 30))
            .unwrap();
        fs::remove_file(
            storage
                .base_path()
                .join(DOMAINS_DIR)
                .join("a.example.com")
                .join(CHAIN_FILE),
        )
        .unwrap();

        let read = storage.load_certificate("a.example.com").unwrap().unwrap();
        assert!(read.chain_pem.is_empty());
    }

    #[test]
    fn unknown_subject_is_none() {
        let (_dir, storage) = open();
        assert!(storage.load_certificate("nothing.example.com").unwrap().is_none());
    }

    #[test]
    fn keys_cannot_escape_root() {
        let (_dir, storage) = open();
        assert!(matches!(
            storage.load_certificate("../etc"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            storage.save_credentials_json("a/b", "{}"),
            Err(StorageError::InvalidKey(_))
        ));
    }
}
