//! One certificate acquisition attempt.
//!
//! Cache check against production, optional staging pre-control, then
//! production issuance or renewal.

use std::sync::Arc;

use certherd_common::{CertificateRecord, DomainSet};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::acme::{AcmeClient, IssueRequest};
use crate::errors::AcquisitionError;

/// Pipeline settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    /// Request a staging certificate before contacting production
    pub staging_precontrol: bool,
    /// Renewal threshold in days before expiry
    pub renew_before_days: u32,
    /// RSA modulus size of new certificate keys
    pub rsa_key_size: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            staging_precontrol: true,
            renew_before_days: 30,
            rsa_key_size: 4096,
        }
    }
}

impl From<&certherd_config::Config> for PipelineSettings {
    fn from(config: &certherd_config::Config) -> Self {
        Self {
            staging_precontrol: !config.disable_staging_precontrol,
            renew_before_days: config.renew_before_days,
            rsa_key_size: config.rsa_key_size,
        }
    }
}

/// Certificate acquisition against a staging and a production issuer
pub struct AcquisitionPipeline {
    staging: Arc<dyn AcmeClient>,
    production: Arc<dyn AcmeClient>,
    settings: PipelineSettings,
}

impl AcquisitionPipeline {
    pub fn new(
        staging: Arc<dyn AcmeClient>,
        production: Arc<dyn AcmeClient>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            staging,
            production,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Production client, also used by the expiry scheduler
    pub fn production(&self) -> &Arc<dyn AcmeClient> {
        &self.production
    }

    /// Obtain a valid certificate for `set`.
    ///
    /// Returns the cached certificate when it is still outside the renewal
    /// window. A staging failure aborts the attempt before production is
    /// contacted.
    pub async fn acquire(&self, set: &DomainSet) -> Result<CertificateRecord, AcquisitionError> {
        let hostnames = set.hostnames.join(",");

        let cached = match self.production.check(&set.hostnames).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(
                    domain = %set.key,
                    error = %e,
                    "Failed to read cached certificate, treating as missing"
                );
                None
            }
        };

        if let Some(record) = &cached {
            if !record.needs_renewal(self.settings.renew_before_days, Utc::now()) {
                debug!(
                    domain = %set.key,
                    expires = %record.not_after,
                    "Cached certificate still valid"
                );
                return Ok(record.clone());
            }
            info!(
                domain = %set.key,
                expires = %record.not_after,
                renew_before_days = self.settings.renew_before_days,
                "Cached certificate is due for renewal"
            );
        }

        let request = IssueRequest {
            hostnames: set.hostnames.clone(),
            contact_email: set.contact_email.clone(),
            rsa_key_size: self.settings.rsa_key_size,
        };

        if self.settings.staging_precontrol {
            debug!(domain = %set.key, "Running staging pre-control");
            self.staging
                .issue(&request)
                .await
                .map_err(|source| AcquisitionError::Validation {
                    hostnames: hostnames.clone(),
                    source,
                })?;
            debug!(domain = %set.key, "Staging pre-control passed");
        }

        match cached {
            Some(current) => self
                .production
                .renew(&request, &current)
                .await
                .map_err(|source| AcquisitionError::Renewal { hostnames, source }),
            None => self
                .production
                .issue(&request)
                .await
                .map_err(|source| AcquisitionError::Issuance { hostnames, source }),
        }
    }
}

impl std::fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("staging", &self.staging.environment())
            .field("production", &self.production.environment())
            .field("settings", &self.settings)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::Environment;
    use crate::testing::{record_expiring_in, FakeAcmeClient};

    fn set() -> DomainSet {
        DomainSet::from_label("a.example.com", "ops@example.com").unwrap()
    }

    fn pipeline(
        staging: &Arc<FakeAcmeClient>,
        production: &Arc<FakeAcmeClient>,
        renew_before_days: u32,
    ) -> AcquisitionPipeline {
        AcquisitionPipeline::new(
            staging.clone(),
            production.clone(),
            PipelineSettings {
                renew_before_days,
                ..PipelineSettings::default()
            },
        )
    }

    #[tokio::test]
    async fn test_valid_cached_certificate_skips_issuer() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));
        production.set_cached(record_expiring_in("a.example.com", 25));

        let record = pipeline(&staging, &production, 15)
            .acquire(&set())
            .await
            .unwrap();

        assert_eq!(record.subject, "a.example.com");
        assert_eq!(staging.issue_calls(), 0);
        assert_eq!(production.issue_calls(), 0);
        assert_eq!(production.renew_calls(), 0);
    }

    #[tokio::test]
    async fn test_expiring_certificate_is_renewed_after_staging() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));
        production.set_cached(record_expiring_in("a.example.com", 10));

        let record = pipeline(&staging, &production, 15)
            .acquire(&set())
            .await
            .unwrap();

        assert_eq!(staging.issue_calls(), 1);
        assert_eq!(production.issue_calls(), 0);
        assert_eq!(production.renew_calls(), 1);
        assert!(record.remaining_validity(Utc::now()) > chrono::Duration::days(80));
    }

    #[tokio::test]
    async fn test_missing_certificate_is_issued() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));

        pipeline(&staging, &production, 15)
            .acquire(&set())
            .await
            .unwrap();

        assert_eq!(staging.issue_calls(), 1);
        assert_eq!(production.issue_calls(), 1);
    }

    #[tokio::test]
    async fn test_staging_failure_never_reaches_production() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));
        staging.fail_next(1);

        let err = pipeline(&staging, &production, 15)
            .acquire(&set())
            .await
            .unwrap_err();

        assert!(matches!(err, AcquisitionError::Validation { .. }));
        assert_eq!(production.issue_calls(), 0);
        assert_eq!(production.renew_calls(), 0);
    }

    #[tokio::test]
    async fn test_precontrol_can_be_disabled() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));
        let pipeline = AcquisitionPipeline::new(
            staging.clone(),
            production.clone(),
            PipelineSettings {
                staging_precontrol: false,
                ..PipelineSettings::default()
            },
        );

        pipeline.acquire(&set()).await.unwrap();

        assert_eq!(staging.issue_calls(), 0);
        assert_eq!(production.issue_calls(), 1);
    }

    #[tokio::test]
    async fn test_production_failure_is_issuance_error() {
        let staging = Arc::new(FakeAcmeClient::new(Environment::Staging));
        let production = Arc::new(FakeAcmeClient::new(Environment::Production));
        production.fail_next(1);

        let err = pipeline(&staging, &production, 15)
            .acquire(&set())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "issuance");
    }
}
