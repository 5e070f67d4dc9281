//! Shared types for certherd.
//!
//! - [`DomainKey`] / [`TaskId`]: identifier newtypes
//! - [`DomainSet`]: hostnames managed as one certificate
//! - [`CertificateRecord`]: issued certificate material

pub mod certificate;
pub mod domain;
pub mod ids;

pub use certificate::CertificateRecord;
pub use domain::{normalize_host, parse_hostnames, DomainError, DomainSet};
pub use ids::{DomainKey, TaskId};
