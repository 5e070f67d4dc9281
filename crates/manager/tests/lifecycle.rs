//! End-to-end lifecycle: discovery -> acquisition -> webhook.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use certherd_common::{CertificateRecord, DomainKey};
use certherd_config::Config;
use certherd_manager::acme::AcmeError;
use certherd_manager::{
    AcmeClient, App, ChallengeManager, Collaborators, DiscoveredService, DiscoveryError,
    Environment, IssueRequest, ServiceSource,
};
use chrono::Utc;
use parking_lot::Mutex;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Issuer that publishes a challenge and issues immediately
struct ScriptedIssuer {
    environment: Environment,
    challenges: ChallengeManager,
    issued: AtomicUsize,
}

impl ScriptedIssuer {
    fn new(environment: Environment, challenges: ChallengeManager) -> Self {
        Self {
            environment,
            challenges,
            issued: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AcmeClient for ScriptedIssuer {
    fn environment(&self) -> Environment {
        self.environment
    }

    async fn check(&self, _hostnames: &[String]) -> Result<Option<CertificateRecord>, AcmeError> {
        Ok(None)
    }

    async fn issue(&self, request: &IssueRequest) -> Result<CertificateRecord, AcmeError> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        let subject = request.hostnames[0].clone();
        self.challenges
            .add_challenge(&subject, "token", &format!("{}-key-auth", self.environment));

        Ok(CertificateRecord {
            subject: subject.clone(),
            hostnames: request.hostnames.clone(),
            private_key: format!("{} key", subject),
            certificate: format!("{} cert", subject),
            chain: "issuer".to_string(),
            not_after: Utc::now() + chrono::Duration::days(90),
        })
    }

    async fn renew(
        &self,
        request: &IssueRequest,
        _current: &CertificateRecord,
    ) -> Result<CertificateRecord, AcmeError> {
        self.issue(request).await
    }
}

#[derive(Default)]
struct ListedServices(Mutex<Vec<DiscoveredService>>);

#[async_trait]
impl ServiceSource for ListedServices {
    async fn list(&self) -> Result<Vec<DiscoveredService>, DiscoveryError> {
        Ok(self.0.lock().clone())
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn discovered_service_is_issued_and_pushed() {
    let webhook = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/docker-flow-proxy/cert"))
        .and(query_param("certName", "a.example.com.pem"))
        .respond_with(ResponseTemplate::new(200).set_body_string("stored"))
        .expect(1)
        .mount(&webhook)
        .await;

    let staging_challenges = ChallengeManager::new();
    let production_challenges = ChallengeManager::new();
    let staging = Arc::new(ScriptedIssuer::new(
        Environment::Staging,
        staging_challenges.clone(),
    ));
    let production = Arc::new(ScriptedIssuer::new(
        Environment::Production,
        production_challenges.clone(),
    ));
    let services = Arc::new(ListedServices::default());
    services.0.lock().push(DiscoveredService::new(
        "a.example.com,b.example.com",
        Some("ops@example.com".to_string()),
    ));

    let config = Config {
        listen_address: "127.0.0.1:0".parse().unwrap(),
        webhook_host: Some(webhook.address().ip().to_string()),
        webhook_port: webhook.address().port(),
        docker_polling_interval_secs: 1,
        ..Config::default()
    };
    let collaborators = Collaborators {
        staging: staging.clone(),
        production: production.clone(),
        staging_challenges: Arc::new(staging_challenges),
        production_challenges: Arc::new(production_challenges),
        source: Some(services.clone()),
        challenge_managers: Vec::new(),
    };

    let app = App::with_collaborators(config, collaborators).await.unwrap();
    let registry = app.registry().clone();
    let challenge_address = app.challenge_address().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(app.run(async {
        let _ = stopped.await;
    }));

    // Issued once through staging and once through production, then pushed
    wait_for(|| production.issued.load(Ordering::SeqCst) == 1).await;
    assert_eq!(staging.issued.load(Ordering::SeqCst), 1);
    let pushed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let requests = webhook.received_requests().await.unwrap_or_default();
            if let Some(request) = requests.into_iter().next() {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        String::from_utf8(pushed.body).unwrap(),
        "a.example.com key\na.example.com cert\nissuer\n"
    );

    // Both environments answer on the shared challenge server, staging first
    let client = reqwest::Client::new();
    let challenge = client
        .get(format!(
            "http://{}/.well-known/acme-challenge/token",
            challenge_address
        ))
        .header("Host", "a.example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(challenge.status(), 200);
    assert_eq!(challenge.text().await.unwrap(), "staging-key-auth");

    // The service disappears and the domain leaves the registry
    services.0.lock().clear();
    let key = DomainKey::from("a.example.com,b.example.com");
    wait_for(|| !registry.contains(&key)).await;
    assert_eq!(production.issued.load(Ordering::SeqCst), 1);

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
}
