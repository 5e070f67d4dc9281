//! Background expiry scheduler
//!
//! Periodically checks the certificate of every registered domain set and
//! re-enqueues the ones that are missing or close to expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::acme::AcmeClient;
use crate::acquisition::{AcquisitionQueue, Task};
use crate::registry::DomainRegistry;

/// Delay before the first sweep
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Outcome of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub checked: usize,
    pub enqueued: usize,
    pub errors: usize,
}

/// Background expiry scheduler
pub struct ExpiryScheduler {
    registry: Arc<DomainRegistry>,
    queue: AcquisitionQueue,
    /// Client whose stored certificates are checked
    client: Arc<dyn AcmeClient>,
    renew_before_days: u32,
    check_interval: Duration,
    initial_delay: Duration,
}

impl ExpiryScheduler {
    pub fn new(
        registry: Arc<DomainRegistry>,
        queue: AcquisitionQueue,
        client: Arc<dyn AcmeClient>,
        renew_before_days: u32,
        check_interval: Duration,
    ) -> Self {
        Self {
            registry,
            queue,
            client,
            renew_before_days,
            check_interval,
            initial_delay: INITIAL_DELAY,
        }
    }

    /// Set the delay before the first sweep
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Run the scheduler loop
    ///
    /// This runs indefinitely, sweeping at the configured interval.
    pub async fn run(self) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            renew_before_days = self.renew_before_days,
            "Starting expiry scheduler"
        );

        tokio::time::sleep(self.initial_delay).await;

        // The first tick completes immediately
        let mut interval = interval(self.check_interval);
        loop {
            interval.tick().await;
            debug!("Running scheduled expiry sweep");
            self.sweep().await;
        }
    }

    /// Check every registered domain set once.
    ///
    /// Errors for one domain are logged and do not stop the sweep.
    pub async fn sweep(&self) -> SweepSummary {
        let entries = self.registry.snapshot();
        let mut summary = SweepSummary::default();
        let now = Utc::now();

        info!(domain_count = entries.len(), "Checking certificates for expiry");

        for entry in entries {
            summary.checked += 1;
            let key = entry.set.key.clone();

            let due = match self.client.check(&entry.set.hostnames).await {
                Ok(None) => {
                    info!(domain = %key, "No certificate stored");
                    true
                }
                Ok(Some(record)) if record.needs_renewal(self.renew_before_days, now) => {
                    info!(
                        domain = %key,
                        expires = %record.not_after,
                        "Certificate needs renewal"
                    );
                    true
                }
                Ok(Some(record)) => {
                    debug!(domain = %key, expires = %record.not_after, "Certificate is still valid");
                    false
                }
                Err(e) => {
                    warn!(
                        domain = %key,
                        error = %e,
                        "Failed to check certificate expiry"
                    );
                    summary.errors += 1;
                    false
                }
            };

            if due && self.queue.enqueue(Task::new(entry)) {
                summary.enqueued += 1;
            }
        }

        info!(
            checked = summary.checked,
            enqueued = summary.enqueued,
            errors = summary.errors,
            "Expiry sweep finished"
        );
        summary
    }
}

impl std::fmt::Debug for ExpiryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryScheduler")
            .field("renew_before_days", &self.renew_before_days)
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::Environment;
    use crate::testing::{record_expiring_in, FakeAcmeClient};
    use certherd_common::{DomainKey, DomainSet};

    fn scheduler(
        registry: &Arc<DomainRegistry>,
        client: &Arc<FakeAcmeClient>,
    ) -> (ExpiryScheduler, AcquisitionQueue, tokio::sync::mpsc::UnboundedReceiver<Task>) {
        let (queue, rx) = AcquisitionQueue::new();
        let scheduler = ExpiryScheduler::new(
            registry.clone(),
            queue.clone(),
            client.clone(),
            15,
            Duration::from_secs(43200),
        );
        (scheduler, queue, rx)
    }

    fn register(registry: &DomainRegistry, label: &str) {
        registry.insert(DomainSet::from_label(label, "ops@example.com").unwrap());
    }

    #[tokio::test]
    async fn test_sweep_enqueues_missing_and_expiring() {
        let registry = Arc::new(DomainRegistry::new());
        let client = Arc::new(FakeAcmeClient::new(Environment::Production));
        register(&registry, "fresh.example.com");
        register(&registry, "expiring.example.com");
        register(&registry, "missing.example.com");
        client.set_cached(record_expiring_in("fresh.example.com", 60));
        client.set_cached(record_expiring_in("expiring.example.com", 5));

        let (scheduler, queue, mut rx) = scheduler(&registry, &client);
        let summary = scheduler.sweep().await;

        assert_eq!(summary.checked, 3);
        assert_eq!(summary.enqueued, 2);
        assert!(queue.is_pending(&DomainKey::from("expiring.example.com")));
        assert!(queue.is_pending(&DomainKey::from("missing.example.com")));
        assert!(!queue.is_pending(&DomainKey::from("fresh.example.com")));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.key().as_str(), "expiring.example.com");
        assert_eq!(second.key().as_str(), "missing.example.com");
    }

    #[tokio::test]
    async fn test_sweep_continues_after_errors() {
        let registry = Arc::new(DomainRegistry::new());
        let client = Arc::new(FakeAcmeClient::new(Environment::Production));
        register(&registry, "a.example.com");
        register(&registry, "b.example.com");
        client.fail_check();

        let (scheduler, _queue, _rx) = scheduler(&registry, &client);
        let summary = scheduler.sweep().await;

        assert_eq!(summary.checked, 2);
        assert_eq!(summary.errors, 2);
        assert_eq!(summary.enqueued, 0);
        assert_eq!(client.check_calls(), 2);
    }

    #[tokio::test]
    async fn test_removed_domain_not_swept() {
        let registry = Arc::new(DomainRegistry::new());
        let client = Arc::new(FakeAcmeClient::new(Environment::Production));
        register(&registry, "a.example.com");
        registry.remove(&DomainKey::from("a.example.com"));

        let (scheduler, queue, _rx) = scheduler(&registry, &client);
        let summary = scheduler.sweep().await;

        assert_eq!(summary.checked, 0);
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_outstanding_task_not_duplicated() {
        let registry = Arc::new(DomainRegistry::new());
        let client = Arc::new(FakeAcmeClient::new(Environment::Production));
        register(&registry, "a.example.com");

        let (scheduler, _queue, _rx) = scheduler(&registry, &client);
        assert_eq!(scheduler.sweep().await.enqueued, 1);
        assert_eq!(scheduler.sweep().await.enqueued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_after_initial_delay() {
        let registry = Arc::new(DomainRegistry::new());
        let client = Arc::new(FakeAcmeClient::new(Environment::Production));
        register(&registry, "a.example.com");

        let (scheduler, _queue, mut rx) = scheduler(&registry, &client);
        let handle = tokio::spawn(scheduler.with_initial_delay(Duration::from_secs(1)).run());

        let task = rx.recv().await.unwrap();
        assert_eq!(task.key().as_str(), "a.example.com");
        handle.abort();
    }
}
