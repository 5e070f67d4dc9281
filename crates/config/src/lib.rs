//! certherd configuration
//!
//! Configuration is read from `CERTHERD_*` environment variables. Every
//! setting has a default, so an empty environment yields a working
//! configuration that polls the local Docker engine and talks to Let's
//! Encrypt.
//!
//! ```text
//! CERTHERD_DEBUG=true
//! CERTHERD_MAX_RETRIES=5
//! CERTHERD_WEBHOOK_HOST=proxy_proxy
//! CERTHERD_STATIC_DOMAINS="a.example.com,b.example.com|ops@example.com"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "CERTHERD_";

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Placeholder replaced by the certificate subject in the webhook path
pub const CERT_SUBJECT_PLACEHOLDER: &str = "{cert_subject}";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("configuration has {} error(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),
}

/// Root configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Debug-level logging
    #[serde(default)]
    pub debug: bool,

    /// Challenge server bind address
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Storage for staging accounts and certificates
    #[serde(default = "default_staging_storage_path")]
    pub staging_storage_path: PathBuf,

    /// Storage for production accounts and certificates
    #[serde(default = "default_production_storage_path")]
    pub production_storage_path: PathBuf,

    #[serde(default = "default_staging_directory_url")]
    pub staging_directory_url: String,

    #[serde(default = "default_production_directory_url")]
    pub production_directory_url: String,

    /// Skip the staging pre-flight issuance
    #[serde(default)]
    pub disable_staging_precontrol: bool,

    /// Base interval of the linear retry backoff
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Retries after which a failing task is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Deadline for one acquisition attempt
    #[serde(default = "default_acquisition_timeout_secs")]
    pub acquisition_timeout_secs: u64,

    /// Poll the Docker engine for labelled services
    #[serde(default = "default_true")]
    pub docker_polling: bool,

    #[serde(default = "default_docker_polling_interval_secs")]
    pub docker_polling_interval_secs: u64,

    /// Docker engine endpoint (`unix://`, `http://` or `tcp://`)
    #[serde(default = "default_docker_host")]
    pub docker_host: String,

    /// Service label holding the hostname list
    #[serde(default = "default_domains_label")]
    pub domains_label: String,

    /// Service label holding the contact email
    #[serde(default = "default_email_label")]
    pub email_label: String,

    /// Contact email for services without an email label
    #[serde(default)]
    pub default_email: Option<String>,

    /// Whitespace separated `label|email` entries managed without discovery
    #[serde(default)]
    pub static_domains: Option<String>,

    /// Webhook destination host; webhooks are disabled when unset
    #[serde(default)]
    pub webhook_host: Option<String>,

    #[serde(default = "default_webhook_port")]
    pub webhook_port: u16,

    #[serde(default = "default_webhook_scheme")]
    pub webhook_scheme: String,

    /// Path template, `{cert_subject}` is replaced per certificate
    #[serde(default = "default_webhook_path")]
    pub webhook_path: String,

    #[serde(default = "default_webhook_method")]
    pub webhook_method: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub webhook_timeout_secs: u64,

    /// Extra delivery attempts after a failed webhook call
    #[serde(default)]
    pub webhook_retries: u32,

    #[serde(default = "default_webhook_retry_interval_secs")]
    pub webhook_retry_interval_secs: u64,

    /// RSA modulus size of certificate keys
    #[serde(default = "default_rsa_key_size")]
    pub rsa_key_size: u32,

    /// Renew certificates expiring within this many days
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,

    #[serde(default = "default_expiry_check_interval_secs")]
    pub expiry_check_interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}
fn default_staging_storage_path() -> PathBuf {
    PathBuf::from("/acme/staging")
}
fn default_production_storage_path() -> PathBuf {
    PathBuf::from("/acme/live")
}
fn default_staging_directory_url() -> String {
    LETS_ENCRYPT_STAGING.to_string()
}
fn default_production_directory_url() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}
fn default_retry_interval_secs() -> u64 {
    60
}
fn default_max_retries() -> u32 {
    10
}
fn default_acquisition_timeout_secs() -> u64 {
    600
}
fn default_docker_polling_interval_secs() -> u64 {
    60
}
fn default_docker_host() -> String {
    "unix:///var/run/docker.sock".to_string()
}
fn default_domains_label() -> String {
    "com.df.letsencrypt.host".to_string()
}
fn default_email_label() -> String {
    "com.df.letsencrypt.email".to_string()
}
fn default_webhook_port() -> u16 {
    8080
}
fn default_webhook_scheme() -> String {
    "http".to_string()
}
fn default_webhook_path() -> String {
    "/v1/docker-flow-proxy/cert?certName={cert_subject}.pem&distribute=true".to_string()
}
fn default_webhook_method() -> String {
    "PUT".to_string()
}
fn default_webhook_timeout_secs() -> u64 {
    30
}
fn default_webhook_retry_interval_secs() -> u64 {
    30
}
fn default_rsa_key_size() -> u32 {
    4096
}
fn default_renew_before_days() -> u32 {
    30
}
fn default_expiry_check_interval_secs() -> u64 {
    12 * 3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            listen_address: default_listen_address(),
            staging_storage_path: default_staging_storage_path(),
            production_storage_path: default_production_storage_path(),
            staging_directory_url: default_staging_directory_url(),
            production_directory_url: default_production_directory_url(),
            disable_staging_precontrol: false,
            retry_interval_secs: default_retry_interval_secs(),
            max_retries: default_max_retries(),
            acquisition_timeout_secs: default_acquisition_timeout_secs(),
            docker_polling: true,
            docker_polling_interval_secs: default_docker_polling_interval_secs(),
            docker_host: default_docker_host(),
            domains_label: default_domains_label(),
            email_label: default_email_label(),
            default_email: None,
            static_domains: None,
            webhook_host: None,
            webhook_port: default_webhook_port(),
            webhook_scheme: default_webhook_scheme(),
            webhook_path: default_webhook_path(),
            webhook_method: default_webhook_method(),
            webhook_timeout_secs: default_webhook_timeout_secs(),
            webhook_retries: 0,
            webhook_retry_interval_secs: default_webhook_retry_interval_secs(),
            rsa_key_size: default_rsa_key_size(),
            renew_before_days: default_renew_before_days(),
            expiry_check_interval_secs: default_expiry_check_interval_secs(),
        }
    }
}

/// Webhook destination, present only when a webhook host is configured
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path_template: String,
    pub method: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_interval: Duration,
}

impl WebhookConfig {
    /// Full target URL for one certificate subject
    pub fn url_for(&self, cert_subject: &str) -> String {
        let path = self.path_template.replace(CERT_SUBJECT_PLACEHOLDER, cert_subject);
        let sep = if path.starts_with('/') { "" } else { "/" };
        format!("{}://{}:{}{}{}", self.scheme, self.host, self.port, sep, path)
    }
}

/// Docker engine endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerEndpoint {
    /// Engine API on a unix socket
    Unix(PathBuf),
    /// Engine API over plain HTTP (base URL without trailing slash)
    Http(String),
}

/// A domain set managed without discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticDomain {
    pub label: String,
    pub email: Option<String>,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = envy::prefixed(ENV_PREFIX).from_env::<Config>()?;
        debug!(
            docker_polling = config.docker_polling,
            webhook = config.webhook_host.is_some(),
            "Loaded configuration from environment"
        );
        Ok(config)
    }

    /// Load configuration from explicit key/value pairs (`CERTHERD_` prefixed).
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter(vars)?)
    }

    /// Run the settings checks and fail on any error.
    ///
    /// Warnings are logged and do not fail validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = validate::validate_settings(self);
        for warning in &result.warnings {
            warn!("{}", warning.message);
        }
        if result.has_errors() {
            return Err(ConfigError::Validation(
                result.errors.iter().map(|e| e.to_string()).collect(),
            ));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.acquisition_timeout_secs)
    }

    pub fn docker_polling_interval(&self) -> Duration {
        Duration::from_secs(self.docker_polling_interval_secs)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_check_interval_secs)
    }

    /// Webhook destination, `None` when webhooks are disabled
    pub fn webhook(&self) -> Option<WebhookConfig> {
        let host = self.webhook_host.as_deref()?.trim();
        if host.is_empty() {
            return None;
        }
        Some(WebhookConfig {
            scheme: self.webhook_scheme.to_ascii_lowercase(),
            host: host.to_string(),
            port: self.webhook_port,
            path_template: self.webhook_path.clone(),
            method: self.webhook_method.to_ascii_uppercase(),
            timeout: Duration::from_secs(self.webhook_timeout_secs),
            retries: self.webhook_retries,
            retry_interval: Duration::from_secs(self.webhook_retry_interval_secs),
        })
    }

    /// Parse the Docker engine endpoint
    pub fn docker_endpoint(&self) -> Result<DockerEndpoint, ConfigError> {
        let host = self.docker_host.trim();
        if let Some(path) = host.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "docker_host",
                    message: "unix socket path is empty".to_string(),
                });
            }
            return Ok(DockerEndpoint::Unix(PathBuf::from(path)));
        }

        let base = match host.strip_prefix("tcp://") {
            Some(rest) => format!("http://{}", rest),
            None => host.to_string(),
        };
        let url = url::Url::parse(&base).map_err(|e| ConfigError::Invalid {
            field: "docker_host",
            message: format!("'{}': {}", host, e),
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Invalid {
                field: "docker_host",
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        Ok(DockerEndpoint::Http(base.trim_end_matches('/').to_string()))
    }

    /// Parse the static domain entries
    pub fn static_domains(&self) -> Vec<StaticDomain> {
        let Some(raw) = self.static_domains.as_deref() else {
            return Vec::new();
        };
        raw.split_whitespace()
            .filter_map(|entry| {
                let (label, email) = match entry.split_once('|') {
                    Some((label, email)) => (label, Some(email.to_string())),
                    None => (entry, None),
                };
                if label.is_empty() {
                    return None;
                }
                Some(StaticDomain {
                    label: label.to_string(),
                    email: email.filter(|e| !e.is_empty()),
                })
            })
            .collect()
    }
}
