//! Configuration linting for operational best practices
//!
//! Flags settings that work but are likely to hurt in production.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, LETS_ENCRYPT_PRODUCTION};

/// Let's Encrypt certificates live 90 days
const ISSUED_VALIDITY_DAYS: u32 = 90;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.disable_staging_precontrol
        && config.production_directory_url == LETS_ENCRYPT_PRODUCTION
    {
        result.add_warning(ValidationWarning::new(
            "Staging pre-control is disabled: failed validations count against production rate limits",
        ));
    }

    if config.renew_before_days >= ISSUED_VALIDITY_DAYS {
        result.add_warning(ValidationWarning::new(format!(
            "renew_before_days ({}) is not below the {} day certificate lifetime, certificates are renewed on every sweep",
            config.renew_before_days, ISSUED_VALIDITY_DAYS
        )));
    }

    if config.webhook().is_none() {
        result.add_warning(ValidationWarning::new(
            "No webhook_host configured: issued certificates are stored but not pushed to a proxy",
        ));
    }

    if !config.docker_polling && config.static_domains().is_empty() {
        result.add_warning(ValidationWarning::new(
            "Docker polling is disabled and no static domains are set: no certificates will be managed",
        ));
    }

    // Backoff of the last retry alone
    let longest_backoff = config
        .retry_interval_secs
        .saturating_mul(u64::from(config.max_retries));
    if longest_backoff > config.expiry_check_interval_secs {
        result.add_warning(ValidationWarning::new(format!(
            "Longest retry backoff ({}s) exceeds the expiry check interval ({}s)",
            longest_backoff, config.expiry_check_interval_secs
        )));
    }

    if config.listen_address.port() != 80 {
        result.add_warning(ValidationWarning::new(format!(
            "Challenge server listens on {}: HTTP-01 validation reaches port 80, make sure it is forwarded",
            config.listen_address
        )));
    }

    result
}
