//! Cluster identity and attestation seams.
//!
//! The owner and cluster IDs form the cluster's trust root. They are derived
//! once by the initializing node, persisted in every node's state, and later
//! extended into TPM PCRs so that verifiers can check a node belongs to the
//! expected cluster.
//!
//! Evidence generation and verification are external capabilities
//! ([`Issuer`], [`Validator`]); this module only binds them to join requests.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::config::RNG_LENGTH_DEFAULT;
use crate::crypto::{self, DIGEST_LEN};
use crate::error::{Error, Result, ResultExt};
use crate::keys::{self, MasterSecret};

/// PCR that carries the owner ID.
pub const PCR_INDEX_OWNER_ID: u32 = 11;

/// PCR that carries the cluster ID.
pub const PCR_INDEX_CLUSTER_ID: u32 = 15;

/// Info label of the owner ID derivation.
const OWNER_ID_INFO: &[u8] = b"id";

/// The cluster's identity pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationId {
    /// Deterministic in the master secret.
    pub owner: Vec<u8>,
    /// Fresh random bytes for every initialized cluster.
    pub cluster: Vec<u8>,
}

impl AttestationId {
    /// Derive the identity of a new cluster from its master secret.
    pub fn derive(master: &MasterSecret) -> Result<Self> {
        let cluster = crypto::generate_random_bytes(RNG_LENGTH_DEFAULT)
            .context("generating cluster ID")?;
        let owner = derive_owner_id(master)?;
        Ok(Self { owner, cluster })
    }
}

/// The owner ID of every cluster created from `master`.
pub fn derive_owner_id(master: &MasterSecret) -> Result<Vec<u8>> {
    let owner = keys::derive_key(master.as_bytes(), keys::KDF_SALT, OWNER_ID_INFO, RNG_LENGTH_DEFAULT)
        .context("deriving owner ID")?;
    Ok(owner.to_vec())
}

// ---------------------------------------------------------------------------
// PCR expectations
// ---------------------------------------------------------------------------

/// Expected PCR values keyed by PCR index.
pub type PcrMap = HashMap<u32, Vec<u8>>;

/// The value of a zeroed PCR after extending it once with `id`.
pub fn id_to_pcr(id: &[u8]) -> [u8; DIGEST_LEN] {
    let measured = crypto::sha256(&[id]);
    crypto::sha256(&[&[0u8; DIGEST_LEN][..], &measured[..]])
}

/// Merge one base64-encoded ID into the expected PCR set.
///
/// - empty input removes `index` (nothing happens if it is absent)
/// - valid base64 inserts or overwrites `index` with [`id_to_pcr`]
/// - invalid base64 errors and leaves `pcrs` untouched
pub fn add_or_skip_pcr(pcrs: &mut PcrMap, index: u32, encoded: &str) -> Result<()> {
    if encoded.is_empty() {
        pcrs.remove(&index);
        return Ok(());
    }
    let decoded = BASE64
        .decode(encoded)
        .with_context(|| format!("decoding ID for PCR {index}"))?;
    pcrs.insert(index, id_to_pcr(&decoded).to_vec());
    Ok(())
}

/// Apply the owner and cluster IDs a verifier expects.
pub fn prepare_validator_pcrs(pcrs: &mut PcrMap, owner_id: &str, cluster_id: &str) -> Result<()> {
    add_or_skip_pcr(pcrs, PCR_INDEX_OWNER_ID, owner_id)?;
    add_or_skip_pcr(pcrs, PCR_INDEX_CLUSTER_ID, cluster_id)
}

// ---------------------------------------------------------------------------
// Evidence
// ---------------------------------------------------------------------------

/// Data a join request's evidence must be bound to.
pub fn join_user_data(disk_uuid: &str, node_name: &str) -> [u8; DIGEST_LEN] {
    crypto::sha256(&[disk_uuid.as_bytes(), &[0u8], node_name.as_bytes()])
}

/// Produces attestation evidence on the joining node.
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Evidence that commits to `user_data`.
    async fn issue(&self, user_data: &[u8]) -> Result<Vec<u8>>;
}

/// Checks attestation evidence on the join service.
///
/// How measurements are verified is opaque to this crate: any error means the
/// peer is not trusted.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, evidence: &[u8], user_data: &[u8]) -> Result<()>;
}

/// Validator that rejects everything; the safe default for an unconfigured
/// service.
pub struct RejectAll;

#[async_trait]
impl Validator for RejectAll {
    async fn validate(&self, _evidence: &[u8], _user_data: &[u8]) -> Result<()> {
        Err(Error::Invalid("no attestation validator configured".into()))
    }
}
