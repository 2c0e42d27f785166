//! Low-level cryptographic operations.
//!
//! This module and `keys` are the only places in the crate that import
//! `ring` directly. Everything that wraps, unwraps or generates key material
//! goes through the functions exposed here.
//!
//! Primitive choices:
//! - **Cipher**: AES-256-GCM (authenticated encryption), used for key wrapping
//! - **Nonce**: 96-bit (12 bytes), generated fresh per operation via `SystemRandom`
//! - **Key size**: 256 bits (32 bytes)
//! - **Digest**: SHA-256

use ring::aead::{self, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::Error;

/// The AEAD algorithm used for every wrap operation.
const ALGORITHM: &aead::Algorithm = &AES_256_GCM;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Size of a wrapping key in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Size of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Newtype to prevent accidental nonce reuse; each one is consumed on use.
struct OwnedNonce(Nonce);

fn generate_nonce() -> Result<OwnedNonce, Error> {
    let rng = SystemRandom::new();
    let mut buf = [0u8; NONCE_LEN];
    rng.fill(&mut buf).map_err(|_| Error::RandomnessFailure)?;
    Ok(OwnedNonce(Nonce::assume_unique_for_key(buf)))
}

fn sealing_key(key_bytes: &[u8]) -> Result<LessSafeKey, Error> {
    let unbound = UnboundKey::new(ALGORITHM, key_bytes).map_err(|_| Error::InvalidKey)?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt `plaintext` under `key_bytes`, binding `aad` into the tag.
///
/// # Layout of returned bytes
/// ```text
/// [ nonce (12 bytes) ][ ciphertext + GCM tag ]
/// ```
pub fn encrypt(key_bytes: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    let key = sealing_key(key_bytes)?;
    let nonce = generate_nonce()?;

    let mut output = Vec::with_capacity(NONCE_LEN + plaintext.len() + ALGORITHM.tag_len());
    output.extend_from_slice(nonce.0.as_ref());
    output.extend_from_slice(plaintext);

    let tag = key
        .seal_in_place_separate_tag(nonce.0, aead::Aad::from(aad), &mut output[NONCE_LEN..])
        .map_err(|_| Error::EncryptionFailure)?;
    output.extend_from_slice(tag.as_ref());

    Ok(output)
}

/// Decrypt a payload produced by [`encrypt`] with the same key and `aad`.
///
/// A wrong key, wrong `aad` or tampered ciphertext all fail the GCM check; the
/// caller never receives partial plaintext.
pub fn decrypt(key_bytes: &[u8], ciphertext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
    if ciphertext.len() < NONCE_LEN {
        return Err(Error::DecryptionFailure);
    }

    let nonce_bytes: [u8; NONCE_LEN] = ciphertext[..NONCE_LEN]
        .try_into()
        .map_err(|_| Error::DecryptionFailure)?;
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let key = sealing_key(key_bytes)?;
    let mut payload = ciphertext[NONCE_LEN..].to_vec();

    let plaintext = key
        .open_in_place(nonce, aead::Aad::from(aad), &mut payload)
        .map_err(|_| Error::DecryptionFailure)?;

    Ok(plaintext.to_vec())
}

/// Generate `len` cryptographically secure random bytes.
pub fn generate_random_bytes(len: usize) -> Result<Vec<u8>, Error> {
    let rng = SystemRandom::new();
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf).map_err(|_| Error::RandomnessFailure)?;
    Ok(buf)
}

/// Generate a fresh 256-bit key.
pub fn generate_random_key() -> Result<[u8; KEY_LEN], Error> {
    let rng = SystemRandom::new();
    let mut key = [0u8; KEY_LEN];
    rng.fill(&mut key).map_err(|_| Error::RandomnessFailure)?;
    Ok(key)
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha256(parts: &[&[u8]]) -> [u8; DIGEST_LEN] {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(part);
    }
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrong_aad_fails() {
        let key = generate_random_key().unwrap();
        let sealed = encrypt(&key, b"dek bytes", b"disk-1").unwrap();
        assert_eq!(decrypt(&key, &sealed, b"disk-1").unwrap(), b"dek bytes");
        assert!(decrypt(&key, &sealed, b"disk-2").is_err());
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = generate_random_key().unwrap();
        assert!(matches!(
            decrypt(&key, &[0u8; 4], b""),
            Err(Error::DecryptionFailure)
        ));
    }

    #[test]
    fn test_invalid_key_length() {
        assert!(matches!(encrypt(&[0u8; 7], b"x", b""), Err(Error::InvalidKey)));
    }

    #[test]
    fn test_random_bytes_length() {
        let a = generate_random_bytes(48).unwrap();
        let b = generate_random_bytes(48).unwrap();
        assert_eq!(a.len(), 48);
        assert_ne!(a, b);
    }

    #[test]
    fn test_keys_and_nonces_are_fresh() {
        let a = generate_random_key().unwrap();
        let b = generate_random_key().unwrap();
        assert_ne!(a, b);

        // Same key and plaintext still seal under different nonces.
        let first = encrypt(&a, b"dek bytes", b"").unwrap();
        let second = encrypt(&a, b"dek bytes", b"").unwrap();
        assert_ne!(first[..NONCE_LEN], second[..NONCE_LEN]);
        assert_eq!(decrypt(&a, &second, b"").unwrap(), b"dek bytes");
    }
}
