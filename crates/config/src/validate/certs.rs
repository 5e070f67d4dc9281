//! Stored certificate validation
//!
//! Scans the production storage for certificates that are already expired
//! or about to be, so `certherd test` shows what the first sweep will renew.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Validate certificates under `<production_storage_path>/domains`
pub async fn validate_stored_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let domains_path = config.production_storage_path.join("domains");

    let entries = match fs::read_dir(&domains_path) {
        Ok(entries) => entries,
        // Nothing issued yet
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return result,
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Storage,
                format!("Cannot read certificate storage {:?}: {}", domains_path, e),
            ));
            return result;
        }
    };

    let threshold = Duration::from_secs(u64::from(config.renew_before_days) * 86400);
    let now = SystemTime::now();

    for entry in entries.flatten() {
        let cert_path = entry.path().join("cert.pem");
        if !cert_path.is_file() {
            continue;
        }
        match stored_expiry(&cert_path) {
            Ok((expiry, shown)) if expiry < now => result.add_warning(ValidationWarning::new(
                format!("{:?} expired at {}, it will be re-issued", cert_path, shown),
            )),
            Ok((expiry, shown)) if expiry < now + threshold => {
                result.add_warning(ValidationWarning::new(format!(
                    "{:?} expires at {} and is due for renewal",
                    cert_path, shown
                )))
            }
            Ok(_) => {}
            Err(reason) => result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Unusable stored certificate {:?}: {}", cert_path, reason),
            )),
        }
    }

    result
}

/// `notAfter` of the leaf in `cert_path`, as a point in time and as shown
/// by the certificate
fn stored_expiry(cert_path: &Path) -> Result<(SystemTime, String), String> {
    let bytes = fs::read(cert_path).map_err(|e| e.to_string())?;
    let block = pem::parse(&bytes).map_err(|e| e.to_string())?;
    let (_, cert) =
        x509_parser::parse_x509_certificate(block.contents()).map_err(|e| e.to_string())?;

    let not_after = cert.validity().not_after;
    let secs = u64::try_from(not_after.timestamp()).unwrap_or(0);
    Ok((
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
        not_after.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_storage_is_fine() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            production_storage_path: dir.path().join("live"),
            ..Default::default()
        };

        let result = validate_stored_certificates(&config).await;
        assert!(!result.has_errors());
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_certificate_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let domain_dir = dir.path().join("domains").join("a.example.com");
        fs::create_dir_all(&domain_dir).unwrap();
        fs::write(domain_dir.join("cert.pem"), "not a certificate").unwrap();

        let config = Config {
            production_storage_path: dir.path().to_path_buf(),
            ..Default::default()
        };

        let result = validate_stored_certificates(&config).await;
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Certificate));
    }
}
