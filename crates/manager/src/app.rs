//! Application wiring
//!
//! Builds the registry, queues and loops from a [`Config`] and runs them on
//! the current tokio runtime until shutdown.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use certherd_config::Config;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::acme::{
    AcmeClient, CertificateStorage, ChallengeManager, ChallengeStore, Environment,
    InstantAcmeClient,
};
use crate::acquisition::{
    AcquisitionPipeline, AcquisitionQueue, AcquisitionWorker, PipelineSettings, RetryPolicy,
};
use crate::discovery::{
    DiscoveredService, DiscoveryReconciler, DockerServiceSource, ServiceSource,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::registry::DomainRegistry;
use crate::scheduler::ExpiryScheduler;
use crate::server::{ChallengeResponder, ChallengeServer};
use crate::webhook::{WebhookDispatcher, WebhookQueue};

/// Age after which an abandoned challenge is dropped
const CHALLENGE_MAX_AGE: Duration = Duration::from_secs(3600);

/// Interval of the abandoned challenge sweep
const CHALLENGE_CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

/// External collaborators of the lifecycle engine
pub struct Collaborators {
    pub staging: Arc<dyn AcmeClient>,
    pub production: Arc<dyn AcmeClient>,
    pub staging_challenges: Arc<dyn ChallengeStore>,
    pub production_challenges: Arc<dyn ChallengeStore>,
    /// `None` disables discovery polling
    pub source: Option<Arc<dyn ServiceSource>>,
    /// In-process challenge managers swept for abandoned challenges
    pub challenge_managers: Vec<ChallengeManager>,
}

impl Collaborators {
    /// Production collaborators: `instant-acme` clients with filesystem
    /// storage and the Docker engine as service source.
    pub fn from_config(config: &Config) -> Result<Self> {
        let staging_challenges = ChallengeManager::new();
        let production_challenges = ChallengeManager::new();

        let staging = InstantAcmeClient::new(
            Environment::Staging,
            config.staging_directory_url.clone(),
            open_storage(&config.staging_storage_path)?,
            staging_challenges.clone(),
        );
        let production = InstantAcmeClient::new(
            Environment::Production,
            config.production_directory_url.clone(),
            open_storage(&config.production_storage_path)?,
            production_challenges.clone(),
        );

        let source: Option<Arc<dyn ServiceSource>> = if config.docker_polling {
            let endpoint = config
                .docker_endpoint()
                .context("Invalid Docker endpoint")?;
            // A listing never outlives one polling period
            let request_timeout = config
                .docker_polling_interval()
                .min(DEFAULT_REQUEST_TIMEOUT);
            Some(Arc::new(
                DockerServiceSource::new(
                    endpoint,
                    config.domains_label.clone(),
                    config.email_label.clone(),
                )
                .with_timeout(request_timeout),
            ))
        } else {
            None
        };

        Ok(Self {
            staging: Arc::new(staging),
            production: Arc::new(production),
            staging_challenges: Arc::new(staging_challenges.clone()),
            production_challenges: Arc::new(production_challenges.clone()),
            source,
            challenge_managers: vec![staging_challenges, production_challenges],
        })
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("staging", &self.staging.environment())
            .field("production", &self.production.environment())
            .field("polling", &self.source.is_some())
            .finish_non_exhaustive()
    }
}

fn open_storage(path: &Path) -> Result<CertificateStorage> {
    CertificateStorage::new(path)
        .with_context(|| format!("Failed to create certificate storage at {}", path.display()))
}

/// The certificate lifecycle manager
#[derive(Debug)]
pub struct App {
    config: Config,
    registry: Arc<DomainRegistry>,
    server: ChallengeServer,
    collaborators: Collaborators,
}

impl App {
    /// Build the application with the production collaborators
    pub async fn new(config: Config) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::with_collaborators(config, collaborators).await
    }

    /// Build the application and bind the challenge server
    pub async fn with_collaborators(config: Config, collaborators: Collaborators) -> Result<Self> {
        let responder = ChallengeResponder::new(
            collaborators.staging_challenges.clone(),
            collaborators.production_challenges.clone(),
        );
        let server = ChallengeServer::bind(config.listen_address, responder)
            .await
            .with_context(|| {
                format!("Failed to bind challenge server on {}", config.listen_address)
            })?;

        Ok(Self {
            config,
            registry: Arc::new(DomainRegistry::new()),
            server,
            collaborators,
        })
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    /// Address the challenge server is bound to
    pub fn challenge_address(&self) -> std::io::Result<std::net::SocketAddr> {
        self.server.local_addr()
    }

    /// Run every loop until `shutdown` completes
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let App {
            config,
            registry,
            server,
            collaborators,
        } = self;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(server.run()));

        let webhook = match config.webhook() {
            Some(webhook_config) => {
                let dispatcher =
                    WebhookDispatcher::new(webhook_config).context("Invalid webhook settings")?;
                let (queue, rx) = WebhookQueue::new();
                tasks.push(tokio::spawn(dispatcher.run(rx)));
                Some(queue)
            }
            None => {
                info!("No webhook host configured, certificates will not be pushed");
                None
            }
        };

        let (queue, rx) = AcquisitionQueue::new();
        let pipeline = AcquisitionPipeline::new(
            collaborators.staging.clone(),
            collaborators.production.clone(),
            PipelineSettings::from(&config),
        );
        let mut worker = AcquisitionWorker::new(
            pipeline,
            registry.clone(),
            queue.clone(),
            RetryPolicy::new(config.retry_interval(), config.max_retries),
            config.acquisition_timeout(),
        );
        if let Some(webhook) = webhook {
            worker = worker.with_webhook(webhook);
        }
        tasks.push(tokio::spawn(worker.run(rx)));

        let static_services: Vec<DiscoveredService> = config
            .static_domains()
            .into_iter()
            .map(DiscoveredService::from)
            .collect();
        let reconciler = DiscoveryReconciler::new(
            registry.clone(),
            queue.clone(),
            collaborators.source.clone(),
            config.docker_polling_interval(),
        )
        .with_static_services(static_services)
        .with_default_email(config.default_email.clone());
        tasks.push(tokio::spawn(reconciler.run()));

        let scheduler = ExpiryScheduler::new(
            registry.clone(),
            queue,
            collaborators.production.clone(),
            config.renew_before_days,
            config.expiry_check_interval(),
        );
        tasks.push(tokio::spawn(scheduler.run()));

        if !collaborators.challenge_managers.is_empty() {
            tasks.push(tokio::spawn(sweep_challenges(
                collaborators.challenge_managers.clone(),
            )));
        }

        info!(
            listen_address = %config.listen_address,
            docker_polling = config.docker_polling,
            staging_precontrol = !config.disable_staging_precontrol,
            "certherd started"
        );

        shutdown.await;

        info!(registered = registry.len(), "Shutting down");
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Drop challenges of orders that never completed
async fn sweep_challenges(managers: Vec<ChallengeManager>) {
    let mut interval = tokio::time::interval(CHALLENGE_CLEANUP_INTERVAL);
    loop {
        interval.tick().await;
        let removed: usize = managers
            .iter()
            .map(|m| m.cleanup_expired(CHALLENGE_MAX_AGE))
            .sum();
        debug!(removed = removed, "Swept abandoned challenges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAcmeClient, FakeServiceSource};
    use certherd_common::DomainKey;

    fn collaborators(source: Arc<FakeServiceSource>) -> Collaborators {
        Collaborators {
            staging: Arc::new(FakeAcmeClient::new(Environment::Staging)),
            production: Arc::new(FakeAcmeClient::new(Environment::Production)),
            staging_challenges: Arc::new(ChallengeManager::new()),
            production_challenges: Arc::new(ChallengeManager::new()),
            source: Some(source),
            challenge_managers: Vec::new(),
        }
    }

    fn config() -> Config {
        Config {
            listen_address: "127.0.0.1:0".parse().unwrap(),
            static_domains: Some("static.example.com|ops@example.com".to_string()),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_run_registers_discovered_and_static_domains() {
        let source = Arc::new(FakeServiceSource::new());
        source.set(vec![DiscoveredService::new(
            "a.example.com",
            Some("ops@example.com".to_string()),
        )]);

        let app = App::with_collaborators(config(), collaborators(source))
            .await
            .unwrap();
        let registry = app.registry().clone();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(app.run(async {
            let _ = stopped.await;
        }));

        while registry.len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.contains(&DomainKey::from("a.example.com")));
        assert!(registry.contains(&DomainKey::from("static.example.com")));

        stop.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            listen_address: taken.local_addr().unwrap(),
            ..Config::default()
        };

        let err = App::with_collaborators(config, collaborators(Arc::new(FakeServiceSource::new())))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to bind challenge server"));
    }
}
