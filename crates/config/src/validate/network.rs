//! Network connectivity validation
//!
//! Checks that the Docker engine and the webhook destination are reachable.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{Config, DockerEndpoint};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate connectivity of configured endpoints
pub async fn validate_endpoints(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.docker_polling {
        match config.docker_endpoint() {
            Ok(DockerEndpoint::Unix(path)) => {
                #[cfg(unix)]
                {
                    if let Err(e) = tokio::net::UnixStream::connect(&path).await {
                        result.add_error(ValidationError::new(
                            ErrorCategory::Network,
                            format!("Docker socket {:?} unreachable: {}", path, e),
                        ));
                    }
                }
                #[cfg(not(unix))]
                {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Network,
                        format!("Docker socket {:?} requires a unix platform", path),
                    ));
                }
            }
            Ok(DockerEndpoint::Http(base)) => {
                match url::Url::parse(&base).ok().and_then(|u| {
                    let host = u.host_str()?.to_string();
                    Some(format!("{}:{}", host, u.port_or_known_default()?))
                }) {
                    Some(address) => check_tcp(&mut result, "Docker engine", &address).await,
                    None => result.add_error(ValidationError::new(
                        ErrorCategory::Network,
                        format!("Docker endpoint '{}' has no host", base),
                    )),
                }
            }
            // Reported by validate_settings
            Err(_) => {}
        }
    }

    if let Some(webhook) = config.webhook() {
        let address = format!("{}:{}", webhook.host, webhook.port);
        check_tcp(&mut result, "Webhook target", &address).await;
    }

    result
}

async fn check_tcp(result: &mut ValidationResult, what: &str, address: &str) {
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("{} '{}' unreachable: {}", what, address, e),
            ));
        }
        Err(_) => {
            result.add_warning(ValidationWarning::new(format!(
                "{} '{}' connection timeout ({}s)",
                what,
                address,
                CONNECT_TIMEOUT.as_secs()
            )));
        }
    }
}
