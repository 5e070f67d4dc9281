//! ACME client collaborator
//!
//! The lifecycle engine talks to the issuer only through [`AcmeClient`] and
//! reads challenge secrets only through [`ChallengeStore`]. This module also
//! ships the production implementation of both.
//!
//! # Architecture
//!
//! - [`AcmeClient`] - Issuance interface, one instance per [`Environment`]
//! - [`InstantAcmeClient`] - Implementation on top of `instant-acme`
//! - [`CertificateStorage`] - Persistent storage for certificates and account keys
//! - [`ChallengeManager`] - Pending HTTP-01 challenges, implements [`ChallengeStore`]
//!
//! # Challenge Flow
//!
//! 1. [`InstantAcmeClient`] creates a new order with the ACME server
//! 2. For each hostname, the ACME server provides a challenge token
//! 3. [`ChallengeManager`] registers `(hostname, token) -> key authorization`
//! 4. The ACME server requests `/.well-known/acme-challenge/<token>`
//! 5. The challenge server looks the token up in the staging, then the
//!    production [`ChallengeStore`]
//! 6. Once validated, the order is finalized and the certificate stored

mod challenge;
mod client;
mod error;
mod instant;
mod storage;

pub use challenge::{ChallengeManager, ChallengeStore, ACME_CHALLENGE_PREFIX};
pub use client::{AcmeClient, Environment, IssueRequest};
pub use error::{AcmeError, StorageError};
pub use instant::{parse_not_after, InstantAcmeClient};
pub use storage::{CertificateMeta, CertificateStorage, StoredCertificate};
