//! Key derivation and ownership.
//!
//! This module owns two responsibilities:
//! 1. Deriving keys and identifiers from a secret using HKDF-SHA256.
//! 2. Holding secret material in types that are opaque, non-cloneable,
//!    and zeroised on drop.
//!
//! ## Derivation structure
//!
//! ```text
//! HKDF-SHA256(
//!     ikm  = secret,
//!     salt = "Constellation",
//!     info = purpose label ("id", "key" + disk uuid, dek name, ...)
//! )
//! ```
//!
//! Distinct info labels produce statistically independent outputs, so the
//! owner ID, every disk passphrase and every cluster-KMS DEK can be derived
//! from the same secret without one revealing another.

use std::fmt;

use ring::hkdf;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::Error;

/// Salt shared by every derivation in the cluster.
pub const KDF_SALT: &[u8] = b"Constellation";

/// HKDF-SHA256 refuses to expand beyond 255 hash lengths.
const MAX_OUTPUT_LEN: usize = 255 * 32;

// ---------------------------------------------------------------------------
// Master secret
// ---------------------------------------------------------------------------

/// The cluster master secret handed to the first node by its operator.
///
/// - Not `Clone`.
/// - Zeroised on drop.
/// - `Debug` never prints the bytes.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret {
    bytes: Vec<u8>,
}

impl MasterSecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl From<&[u8]> for MasterSecret {
    fn from(bytes: &[u8]) -> Self {
        Self::new(bytes.to_vec())
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(<redacted>)")
    }
}

// ---------------------------------------------------------------------------
// Derived key
// ---------------------------------------------------------------------------

/// Key material produced by [`derive_key`].
///
/// Zeroised on drop. Callers that need to hand the bytes to a collaborator
/// (disk passphrase, wire message) copy them out with [`DerivedKey::to_vec`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    bytes: Vec<u8>,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey(<{} bytes>)", self.bytes.len())
    }
}

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Output length for `ring`'s HKDF expand step.
struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive `len` bytes from `secret` for the purpose named by `info`.
///
/// # Security properties
/// - HKDF is one-way: the output reveals nothing about `secret`.
/// - Different `info` values produce statistically independent outputs.
/// - The same inputs always produce the same output.
pub fn derive_key(secret: &[u8], salt: &[u8], info: &[u8], len: usize) -> Result<DerivedKey, Error> {
    if len == 0 || len > MAX_OUTPUT_LEN {
        return Err(Error::KeyDerivationFailure);
    }

    // Extract phase: pseudorandom key from the secret, domain-separated by salt.
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, salt);
    let prk = salt.extract(secret);

    // Expand phase: the info label scopes the output to one purpose.
    let info_slices = [info];
    let okm = prk
        .expand(&info_slices, OutputLen(len))
        .map_err(|_| Error::KeyDerivationFailure)?;

    let mut derived = vec![0u8; len];
    okm.fill(&mut derived)
        .map_err(|_| Error::KeyDerivationFailure)?;

    Ok(DerivedKey { bytes: derived })
}

/// Derive the state disk passphrase of the initializing node.
///
/// The disk UUID is lowercased first so that device tools reporting it in a
/// different case still yield the same passphrase.
pub fn derive_disk_passphrase(
    master: &MasterSecret,
    disk_uuid: &str,
    len: usize,
) -> Result<DerivedKey, Error> {
    let info = format!("key{}", disk_uuid.to_lowercase());
    derive_key(master.as_bytes(), KDF_SALT, info.as_bytes(), len)
}
