//! Service discovery
//!
//! A [`ServiceSource`] lists the services carrying the domains label; the
//! [`DiscoveryReconciler`] diffs that listing against the domain registry.

mod docker;
mod reconciler;

pub use docker::{DockerServiceSource, DEFAULT_REQUEST_TIMEOUT};
pub use reconciler::{DiscoveryReconciler, ReconcileSummary};

use async_trait::async_trait;

use crate::errors::DiscoveryError;

/// One labelled service as seen by discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Raw value of the domains label
    pub label: String,
    /// Value of the email label, if set
    pub email: Option<String>,
}

impl DiscoveredService {
    pub fn new(label: impl Into<String>, email: Option<String>) -> Self {
        Self {
            label: label.into(),
            email,
        }
    }
}

impl From<certherd_config::StaticDomain> for DiscoveredService {
    fn from(domain: certherd_config::StaticDomain) -> Self {
        Self {
            label: domain.label,
            email: domain.email,
        }
    }
}

/// Listing of the services currently carrying the domains label
#[async_trait]
pub trait ServiceSource: Send + Sync {
    async fn list(&self) -> Result<Vec<DiscoveredService>, DiscoveryError>;
}
