//! certherd certificate lifecycle manager
//!
//! Watches a container orchestrator for services carrying a hostname label,
//! obtains and renews certificates for those hostnames from an ACME issuer,
//! answers HTTP-01 challenges, and pushes issued certificates to a
//! downstream proxy over a webhook.
//!
//! - **Discovery**: periodic reconciliation of labelled services into the
//!   [`DomainRegistry`]
//! - **Acquisition**: serialized queue with staging pre-control, linear
//!   backoff and a retry ceiling
//! - **Expiry**: periodic sweep re-enqueueing certificates close to expiry
//! - **Webhook**: serialized, FIFO certificate delivery
//! - **Challenges**: HTTP server answering from the staging, then the
//!   production challenge store

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod acquisition;
pub mod app;
pub mod discovery;
pub mod errors;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod webhook;

#[cfg(test)]
mod testing;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Collaborators
pub use acme::{AcmeClient, ChallengeManager, ChallengeStore, Environment, IssueRequest};
pub use discovery::{DiscoveredService, ServiceSource};

// Lifecycle engine
pub use acquisition::{AcquisitionPipeline, AcquisitionQueue, AcquisitionWorker, RetryPolicy, Task};
pub use discovery::DiscoveryReconciler;
pub use registry::{DomainRegistry, RegisteredDomain};
pub use scheduler::ExpiryScheduler;
pub use server::{ChallengeResponder, ChallengeServer};
pub use webhook::{WebhookDispatcher, WebhookQueue};

// Errors
pub use errors::{AcquisitionError, ChallengeLookupError, DiscoveryError, WebhookError};

// Wiring
pub use app::{App, Collaborators};
