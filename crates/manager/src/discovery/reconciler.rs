//! Discovery reconciliation
//!
//! Diffs the observed services against the domain registry: labels seen for
//! the first time are registered and enqueued once, labels no longer seen
//! are unregistered. Labels already registered are left alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use certherd_common::{DomainKey, DomainSet};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use super::{DiscoveredService, ServiceSource};
use crate::acquisition::{AcquisitionQueue, Task};
use crate::errors::DiscoveryError;
use crate::registry::DomainRegistry;

/// Outcome of one reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub ignored: usize,
}

/// Keeps the domain registry in sync with the discovered services
pub struct DiscoveryReconciler {
    registry: Arc<DomainRegistry>,
    queue: AcquisitionQueue,
    /// `None` when polling is disabled
    source: Option<Arc<dyn ServiceSource>>,
    /// Services managed without discovery, merged into every pass
    static_services: Vec<DiscoveredService>,
    default_email: Option<String>,
    poll_interval: Duration,
}

impl DiscoveryReconciler {
    pub fn new(
        registry: Arc<DomainRegistry>,
        queue: AcquisitionQueue,
        source: Option<Arc<dyn ServiceSource>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            source,
            static_services: Vec::new(),
            default_email: None,
            poll_interval,
        }
    }

    pub fn with_static_services(mut self, services: Vec<DiscoveredService>) -> Self {
        self.static_services = services;
        self
    }

    /// Contact email for services without an email label
    pub fn with_default_email(mut self, email: Option<String>) -> Self {
        self.default_email = email.filter(|e| !e.trim().is_empty());
        self
    }

    /// Poll the source once and reconcile.
    ///
    /// A failed listing leaves the registry untouched.
    pub async fn poll(&self) -> Result<ReconcileSummary, DiscoveryError> {
        let mut observed = match &self.source {
            Some(source) => source.list().await?,
            None => Vec::new(),
        };
        observed.extend(self.static_services.iter().cloned());
        Ok(self.reconcile(&observed))
    }

    /// Apply an observed service list to the registry.
    ///
    /// Idempotent: a second call with the same list changes nothing.
    pub fn reconcile(&self, observed: &[DiscoveredService]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        // First occurrence of a label wins, observed order is kept
        let mut seen: HashSet<DomainKey> = HashSet::new();
        let current: Vec<(DomainKey, &DiscoveredService)> = observed
            .iter()
            .filter_map(|service| {
                let key = DomainKey::new(service.label.as_str());
                seen.insert(key.clone()).then_some((key, service))
            })
            .collect();

        for key in self.registry.keys() {
            if !seen.contains(&key) && self.registry.remove(&key).is_some() {
                info!(domain = %key, "Removing domain from managed list");
                summary.removed += 1;
            }
        }

        for (key, service) in &current {
            if self.registry.contains(key) {
                continue;
            }

            let set = match self.domain_set(service) {
                Some(set) => set,
                None => {
                    summary.ignored += 1;
                    continue;
                }
            };

            if let Some(entry) = self.registry.insert(set) {
                info!(
                    domain = %key,
                    hostnames = ?entry.set.hostnames,
                    "Adding new certificate to queue"
                );
                self.queue.enqueue(Task::new(entry));
                summary.added += 1;
            }
        }

        debug!(
            observed = current.len(),
            added = summary.added,
            removed = summary.removed,
            ignored = summary.ignored,
            registered = self.registry.len(),
            "Reconciled discovered services"
        );
        summary
    }

    fn domain_set(&self, service: &DiscoveredService) -> Option<DomainSet> {
        let email = service
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .or(self.default_email.as_deref());

        let Some(email) = email else {
            warn!(label = %service.label, "Service has no contact email, ignoring");
            return None;
        };

        match DomainSet::from_label(&service.label, email) {
            Ok(set) => Some(set),
            Err(e) => {
                warn!(label = %service.label, error = %e, "Ignoring service");
                None
            }
        }
    }

    /// Run the discovery loop
    ///
    /// With polling disabled only the static services are reconciled, once.
    pub async fn run(self) {
        if self.source.is_none() {
            info!(
                static_domains = self.static_services.len(),
                "Docker polling disabled, managing static domains only"
            );
            if let Err(e) = self.poll().await {
                error!(error = %e, "Failed to reconcile static domains");
            }
            return;
        }

        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            static_domains = self.static_services.len(),
            "Starting service discovery"
        );

        let mut interval = interval(self.poll_interval);
        loop {
            interval.tick().await;
            debug!("Polling labelled services");

            if let Err(e) = self.poll().await {
                error!(error = %e, "Failed to get service list");
            }
        }
    }
}

impl std::fmt::Debug for DiscoveryReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryReconciler")
            .field("polling", &self.source.is_some())
            .field("static_services", &self.static_services)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}
