//! # bootstrapper
//!
//! Attestation-gated bootstrap and join protocol for confidential Kubernetes
//! nodes.
//!
//! The first control-plane node is initialized once through the
//! [`initserver`], which turns the operator's master secret into the cluster
//! identity and the node's disk passphrase. Every other node runs a
//! [`joinclient`] that polls the control plane's [`joinservice`] until one
//! peer trusts its attestation evidence and hands back a join ticket. A
//! process-wide [`nodelock`] guarantees that only one of these two paths ever
//! writes the node's persistent state.
//!
//! Disk keys for joining nodes come from a [`kms`] selected by URI at startup.
//!
//! ## External collaborators
//!
//! Disk encryption, cloud metadata, attestation evidence, Kubernetes and
//! cloud KMS clients are reached through traits only:
//! [`disk::EncryptedDisk`], [`metadata::MetadataApi`], [`attestation::Issuer`],
//! [`attestation::Validator`], [`joinclient::ClusterJoiner`],
//! [`initserver::ClusterInitializer`], [`joinservice::TokenIssuer`],
//! [`joinservice::CertificateIssuer`] and [`kms::BackendConnector`].

// Module declarations.
pub(crate) mod crypto;
pub mod attestation;
pub mod config;
pub mod disk;
pub mod error;
pub mod initserver;
pub mod joinclient;
pub mod joinproto;
pub mod joinservice;
pub mod keys;
pub mod kms;
pub mod logging;
pub mod metadata;
pub mod nodelock;
pub mod nodestate;
pub mod wire;

pub use error::{Error, Result};

use config::RNG_LENGTH_DEFAULT;
use keys::MasterSecret;

/// Generate a fresh cluster master secret.
///
/// Operators normally supply their own; this is for tooling that creates one
/// on their behalf.
pub fn generate_master_secret() -> Result<MasterSecret> {
    let bytes = crypto::generate_random_bytes(RNG_LENGTH_DEFAULT)?;
    Ok(MasterSecret::new(bytes))
}
