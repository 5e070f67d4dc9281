//! Configuration validation
//!
//! Three passes, from cheapest to most expensive:
//!
//! - [`validate_settings`]: value checks, errors make the config unusable
//! - [`lint::lint_config`]: operational warnings
//! - [`network::validate_endpoints`] / [`certs::validate_stored_certificates`]:
//!   probe the environment (used by `certherd test`)

use std::fmt;

use certherd_common::parse_hostnames;

use crate::{Config, CERT_SUBJECT_PLACEHOLDER};

#[cfg(feature = "validation")]
pub mod certs;
pub mod lint;
#[cfg(feature = "validation")]
pub mod network;

/// RSA key sizes accepted for certificate keys
pub const SUPPORTED_RSA_KEY_SIZES: [u32; 3] = [2048, 3072, 4096];

/// Webhook methods accepted by the downstream proxy
pub const SUPPORTED_WEBHOOK_METHODS: [&str; 3] = ["PUT", "POST", "PATCH"];

/// Area of the configuration an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Acquisition,
    Discovery,
    Webhook,
    Storage,
    Certificate,
    Network,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Acquisition => "acquisition",
            ErrorCategory::Discovery => "discovery",
            ErrorCategory::Webhook => "webhook",
            ErrorCategory::Storage => "storage",
            ErrorCategory::Certificate => "certificate",
            ErrorCategory::Network => "network",
        };
        f.write_str(name)
    }
}

/// A configuration error
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// A non-fatal finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Collected errors and warnings of a validation pass
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Append another pass's findings
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Check individual settings
pub fn validate_settings(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if !SUPPORTED_RSA_KEY_SIZES.contains(&config.rsa_key_size) {
        result.add_error(ValidationError::new(
            ErrorCategory::Acquisition,
            format!(
                "rsa_key_size {} is not supported (use one of {:?})",
                config.rsa_key_size, SUPPORTED_RSA_KEY_SIZES
            ),
        ));
    }

    if config.acquisition_timeout_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Acquisition,
            "acquisition_timeout_secs must be greater than 0",
        ));
    }

    if config.retry_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Acquisition,
            "retry_interval_secs must be greater than 0",
        ));
    }

    if config.expiry_check_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Acquisition,
            "expiry_check_interval_secs must be greater than 0",
        ));
    }

    for (field, value) in [
        ("staging_directory_url", &config.staging_directory_url),
        ("production_directory_url", &config.production_directory_url),
    ] {
        if let Err(e) = url::Url::parse(value) {
            result.add_error(ValidationError::new(
                ErrorCategory::Acquisition,
                format!("{} '{}' is not a valid URL: {}", field, value, e),
            ));
        }
    }

    if config.staging_storage_path == config.production_storage_path {
        result.add_error(ValidationError::new(
            ErrorCategory::Storage,
            format!(
                "staging and production storage share the path {:?}",
                config.production_storage_path
            ),
        ));
    }

    if config.docker_polling {
        if config.docker_polling_interval_secs == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Discovery,
                "docker_polling_interval_secs must be greater than 0",
            ));
        }
        if let Err(e) = config.docker_endpoint() {
            result.add_error(ValidationError::new(ErrorCategory::Discovery, e.to_string()));
        }
        if config.domains_label.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Discovery,
                "domains_label must not be empty",
            ));
        }
    }

    for entry in config.static_domains() {
        if parse_hostnames(&entry.label).is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Discovery,
                format!("static domain '{}' names no hostname", entry.label),
            ));
        }
        if entry.email.is_none() && config.default_email.is_none() {
            result.add_error(ValidationError::new(
                ErrorCategory::Discovery,
                format!(
                    "static domain '{}' has no email and no default_email is set",
                    entry.label
                ),
            ));
        }
    }

    if let Some(webhook) = config.webhook() {
        if !SUPPORTED_WEBHOOK_METHODS.contains(&webhook.method.as_str()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Webhook,
                format!(
                    "webhook_method '{}' is not supported (use one of {:?})",
                    webhook.method, SUPPORTED_WEBHOOK_METHODS
                ),
            ));
        }
        if let Err(e) = url::Url::parse(&webhook.url_for("example.com")) {
            result.add_error(ValidationError::new(
                ErrorCategory::Webhook,
                format!("webhook target does not form a valid URL: {}", e),
            ));
        }
        if !webhook.path_template.contains(CERT_SUBJECT_PLACEHOLDER) {
            result.add_warning(ValidationWarning::new(format!(
                "webhook_path has no {} placeholder, every certificate goes to the same path",
                CERT_SUBJECT_PLACEHOLDER
            )));
        }
    }

    result
}
