//! `instant-acme` backed ACME client
//!
//! One instance per issuer environment. Accounts are created per contact
//! email and their credentials persisted in [`CertificateStorage`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use certherd_common::CertificateRecord;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair, RsaKeySize};
use tracing::{debug, info, warn};

use super::challenge::ChallengeManager;
use super::client::{AcmeClient, Environment, IssueRequest};
use super::error::AcmeError;
use super::storage::{CertificateMeta, CertificateStorage, StoredCertificate};

/// Delay between order status polls
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Maximum time to wait for validation and issuance of one order
const ORDER_TIMEOUT: Duration = Duration::from_secs(180);

/// ACME client for one issuer environment
pub struct InstantAcmeClient {
    environment: Environment,
    directory_url: String,
    storage: CertificateStorage,
    challenges: ChallengeManager,
    /// Accounts restored or created so far, by contact email
    accounts: DashMap<String, Account>,
}

impl InstantAcmeClient {
    pub fn new(
        environment: Environment,
        directory_url: impl Into<String>,
        storage: CertificateStorage,
        challenges: ChallengeManager,
    ) -> Self {
        Self {
            environment,
            directory_url: directory_url.into(),
            storage,
            challenges,
            accounts: DashMap::new(),
        }
    }

    /// Challenge manager the order flow publishes key authorizations to
    pub fn challenges(&self) -> &ChallengeManager {
        &self.challenges
    }

    pub fn storage(&self) -> &CertificateStorage {
        &self.storage
    }

    /// Get the account of `email`, restoring or creating it as needed
    async fn account(&self, email: &str) -> Result<Account, AcmeError> {
        if let Some(account) = self.accounts.get(email) {
            return Ok(account.clone());
        }

        if let Some(json) = self.storage.load_credentials_json(email)? {
            let credentials: AccountCredentials = serde_json::from_str(&json)
                .map_err(|e| AcmeError::Account(format!("corrupt credentials: {}", e)))?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| AcmeError::Account(format!("failed to restore account: {}", e)))?;
            debug!(environment = %self.environment, email = %email, "Restored ACME account");
            self.accounts.insert(email.to_string(), account.clone());
            return Ok(account);
        }

        info!(
            environment = %self.environment,
            email = %email,
            directory = %self.directory_url,
            "Creating new ACME account"
        );

        let contact = format!("mailto:{}", email);
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::create(&new_account, &self.directory_url, None)
            .await
            .map_err(|e| AcmeError::Account(format!("failed to create account: {}", e)))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::Account(format!("failed to serialize credentials: {}", e)))?;
        self.storage.save_credentials_json(email, &json)?;
        self.accounts.insert(email.to_string(), account.clone());

        info!(environment = %self.environment, account_id = %account.id(), "Created ACME account");
        Ok(account)
    }

    /// Run the full HTTP-01 order flow and store the result
    async fn order_certificate(&self, request: &IssueRequest) -> Result<CertificateRecord, AcmeError> {
        let subject = request
            .hostnames
            .first()
            .ok_or_else(|| AcmeError::OrderCreation("no hostnames requested".to_string()))?
            .clone();
        let start = Instant::now();

        let account = self.account(&request.contact_email).await?;

        let identifiers: Vec<Identifier> = request
            .hostnames
            .iter()
            .map(|h| Identifier::Dns(h.clone()))
            .collect();
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::OrderCreation(e.to_string()))?;

        debug!(environment = %self.environment, subject = %subject, "Created ACME order");

        let registered = self.publish_challenges(&mut order).await?;
        let result = self.complete_order(&mut order, request).await;

        for (hostname, token) in &registered {
            self.challenges.remove_challenge(hostname, token);
        }
        let (chain_pem, key_pem) = result?;

        let stored = split_chain(&chain_pem, key_pem, &request.hostnames, &self.directory_url)?;
        self.storage.save_certificate(&subject, &stored)?;

        info!(
            environment = %self.environment,
            subject = %subject,
            expires = %stored.meta.expires,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate issued"
        );

        Ok(stored.into_record(&subject))
    }

    /// Register key authorizations and tell the issuer they are ready
    async fn publish_challenges(
        &self,
        order: &mut Order,
    ) -> Result<Vec<(String, String)>, AcmeError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::OrderCreation(format!("failed to fetch authorizations: {}", e)))?;

        let mut registered = Vec::new();
        for auth in &authorizations {
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }

            let hostname = match &auth.identifier {
                Identifier::Dns(name) => name.clone(),
                #[allow(unreachable_patterns)]
                other => {
                    return Err(AcmeError::OrderCreation(format!(
                        "unsupported identifier {:?}",
                        other
                    )))
                }
            };

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::NoHttp01Challenge(hostname.clone()))?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .add_challenge(&hostname, &challenge.token, key_auth.as_str());
            registered.push((hostname.clone(), challenge.token.clone()));

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| AcmeError::ChallengeValidation(format!("{}: {}", hostname, e)))?;
        }

        Ok(registered)
    }

    /// Wait for validation, finalize, and download the chain.
    ///
    /// Returns `(chain_pem, key_pem)`.
    async fn complete_order(
        &self,
        order: &mut Order,
        request: &IssueRequest,
    ) -> Result<(String, String), AcmeError> {
        let start = Instant::now();

        loop {
            if start.elapsed() > ORDER_TIMEOUT {
                return Err(AcmeError::Timeout(ORDER_TIMEOUT));
            }
            let state = order
                .refresh()
                .await
                .map_err(|e| AcmeError::ChallengeValidation(e.to_string()))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    let reason = state
                        .error
                        .as_ref()
                        .map(|e| format!("{:?}", e))
                        .unwrap_or_else(|| "order invalid".to_string());
                    return Err(AcmeError::ChallengeValidation(reason));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(ORDER_POLL_INTERVAL).await;
                }
            }
        }

        let key_pair = generate_key(request.rsa_key_size)?;
        let params = CertificateParams::new(request.hostnames.clone())
            .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::KeyGeneration(e.to_string()))?;

        if order.state().status != OrderStatus::Valid {
            order
                .finalize(csr.der())
                .await
                .map_err(|e| AcmeError::Finalization(e.to_string()))?;
        }

        let chain_pem = loop {
            if start.elapsed() > ORDER_TIMEOUT {
                return Err(AcmeError::Timeout(ORDER_TIMEOUT));
            }
            match order
                .certificate()
                .await
                .map_err(|e| AcmeError::Finalization(e.to_string()))?
            {
                Some(chain) => break chain,
                None => tokio::time::sleep(ORDER_POLL_INTERVAL).await,
            }
        };

        Ok((chain_pem, key_pair.serialize_pem()))
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    fn environment(&self) -> Environment {
        self.environment
    }

    async fn check(&self, hostnames: &[String]) -> Result<Option<CertificateRecord>, AcmeError> {
        let Some(subject) = hostnames.first() else {
            return Ok(None);
        };
        let Some(stored) = self.storage.load_certificate(subject)? else {
            return Ok(None);
        };
        let record = stored.into_record(subject);
        if !record.covers(hostnames) {
            debug!(
                environment = %self.environment,
                subject = %subject,
                "Stored certificate does not cover all hostnames"
            );
            return Ok(None);
        }
        Ok(Some(record))
    }

    async fn issue(&self, request: &IssueRequest) -> Result<CertificateRecord, AcmeError> {
        self.order_certificate(request).await
    }

    async fn renew(
        &self,
        request: &IssueRequest,
        current: &CertificateRecord,
    ) -> Result<CertificateRecord, AcmeError> {
        info!(
            environment = %self.environment,
            subject = %current.subject,
            expires = %current.not_after,
            "Renewing certificate"
        );
        self.order_certificate(request).await
    }
}

impl std::fmt::Debug for InstantAcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeClient")
            .field("environment", &self.environment)
            .field("directory_url", &self.directory_url)
            .field("accounts", &self.accounts.len())
            .finish()
    }
}

/// Generate the certificate key
fn generate_key(rsa_key_size: u32) -> Result<KeyPair, AcmeError> {
    let size = match rsa_key_size {
        2048 => RsaKeySize::_2048,
        3072 => RsaKeySize::_3072,
        4096 => RsaKeySize::_4096,
        other => {
            return Err(AcmeError::KeyGeneration(format!(
                "unsupported RSA key size {}",
                other
            )))
        }
    };
    KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, size)
        .map_err(|e| AcmeError::KeyGeneration(e.to_string()))
}

/// Split a PEM chain into leaf and issuers and read the leaf's expiry
fn split_chain(
    chain_pem: &str,
    key_pem: String,
    hostnames: &[String],
    issuer: &str,
) -> Result<StoredCertificate, AcmeError> {
    let blocks = pem::parse_many(chain_pem).map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
    let (leaf, issuers) = blocks
        .split_first()
        .ok_or_else(|| AcmeError::CertificateParse("empty certificate chain".to_string()))?;

    let expires = parse_not_after(leaf.contents())?;
    if issuers.is_empty() {
        warn!(subject = ?hostnames.first(), "Issuer returned a certificate without chain");
    }

    Ok(StoredCertificate {
        cert_pem: pem::encode(leaf),
        chain_pem: pem::encode_many(issuers),
        key_pem,
        meta: CertificateMeta {
            expires,
            issued: Utc::now(),
            domains: hostnames.to_vec(),
            issuer: Some(issuer.to_string()),
        },
    })
}

/// Read `notAfter` from a DER certificate
pub fn parse_not_after(der: &[u8]) -> Result<DateTime<Utc>, AcmeError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| AcmeError::CertificateParse(e.to_string()))?;
    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| AcmeError::CertificateParse(format!("notAfter out of range: {}", timestamp)))
}
