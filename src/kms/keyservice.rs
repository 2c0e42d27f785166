//! Remote key service capability.
//!
//! [`KeyServiceApi`] is the slice of a cloud KMS that the stored-DEK backends
//! need: look up, create and import keys, then wrap and unwrap DEKs with them.
//! Each cloud's SDK client implements it outside this crate.
//! [`InMemoryKeyService`] implements it in process.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::crypto::{self, KEY_LEN};
use crate::error::{Error, Result};

/// Where the key material of a new key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    /// Generated by the service.
    Service,
    /// Imported by the caller afterwards.
    External,
}

/// Properties of a key to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpec {
    pub origin: KeyOrigin,
    pub hardware_protected: bool,
    pub policy: Option<String>,
    pub tags: BTreeMap<String, String>,
}

/// A key, optionally pinned to one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRef<'a> {
    pub name: &'a str,
    pub version: Option<&'a str>,
}

impl<'a> KeyRef<'a> {
    pub fn latest(name: &'a str) -> Self {
        Self { name, version: None }
    }
}

#[async_trait]
pub trait KeyServiceApi: Send + Sync {
    /// The latest version of `name`, `None` if no such key exists.
    async fn key_version(&self, name: &str) -> Result<Option<String>>;

    /// Create `name` and return its first version.
    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<String>;

    /// Import `material` as a new version of `name`, creating the key if
    /// needed. Returns the new version.
    async fn import_key(&self, name: &str, material: &[u8], spec: &KeySpec) -> Result<String>;

    async fn wrap(&self, key: KeyRef<'_>, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>>;

    async fn unwrap(&self, key: KeyRef<'_>, ciphertext: &[u8], context: &[u8]) -> Result<Vec<u8>>;

    /// Mark `name` for deletion.
    async fn schedule_deletion(&self, name: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoredKey {
    spec: Option<KeySpec>,
    versions: Vec<Option<Vec<u8>>>,
    pending_deletion: bool,
}

/// Key service kept in process memory. Wraps with AES-256-GCM and binds the
/// wrap context as associated data.
#[derive(Default)]
pub struct InMemoryKeyService {
    keys: Mutex<HashMap<String, StoredKey>>,
}

impl InMemoryKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The [`KeySpec`] `name` was created with, for inspection in tests.
    pub async fn spec_of(&self, name: &str) -> Option<KeySpec> {
        self.keys.lock().await.get(name).and_then(|k| k.spec.clone())
    }

    pub async fn is_pending_deletion(&self, name: &str) -> bool {
        self.keys
            .lock()
            .await
            .get(name)
            .map_or(false, |k| k.pending_deletion)
    }

    async fn material(&self, key: KeyRef<'_>) -> Result<Vec<u8>> {
        let keys = self.keys.lock().await;
        let stored = keys
            .get(key.name)
            .filter(|k| !k.pending_deletion)
            .ok_or_else(|| Error::Backend(format!("key {} not found", key.name)))?;
        let index = match key.version {
            None => stored.versions.len().checked_sub(1),
            Some(v) => v.parse::<usize>().ok().and_then(|v| v.checked_sub(1)),
        };
        index
            .and_then(|i| stored.versions.get(i))
            .and_then(|m| m.clone())
            .ok_or_else(|| Error::Backend(format!("key {} has no usable version", key.name)))
    }
}

#[async_trait]
impl KeyServiceApi for InMemoryKeyService {
    async fn key_version(&self, name: &str) -> Result<Option<String>> {
        let keys = self.keys.lock().await;
        Ok(keys
            .get(name)
            .filter(|k| !k.pending_deletion && !k.versions.is_empty())
            .map(|k| k.versions.len().to_string()))
    }

    async fn create_key(&self, name: &str, spec: &KeySpec) -> Result<String> {
        let material = match spec.origin {
            KeyOrigin::Service => Some(crypto::generate_random_key()?.to_vec()),
            KeyOrigin::External => None,
        };
        let mut keys = self.keys.lock().await;
        if keys.get(name).map_or(false, |k| !k.pending_deletion) {
            return Err(Error::Backend(format!("key {name} already exists")));
        }
        keys.insert(
            name.to_string(),
            StoredKey {
                spec: Some(spec.clone()),
                versions: vec![material],
                pending_deletion: false,
            },
        );
        Ok("1".to_string())
    }

    async fn import_key(&self, name: &str, material: &[u8], spec: &KeySpec) -> Result<String> {
        if material.len() != KEY_LEN {
            return Err(Error::InvalidKey);
        }
        let mut keys = self.keys.lock().await;
        let stored = keys.entry(name.to_string()).or_default();
        if stored.spec.is_none() {
            stored.spec = Some(spec.clone());
        }
        // An externally-originated key waits for its first import.
        if matches!(stored.versions.last(), Some(None)) {
            stored.versions.pop();
        }
        stored.versions.push(Some(material.to_vec()));
        Ok(stored.versions.len().to_string())
    }

    async fn wrap(&self, key: KeyRef<'_>, plaintext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let material = self.material(key).await?;
        crypto::encrypt(&material, plaintext, context)
    }

    async fn unwrap(&self, key: KeyRef<'_>, ciphertext: &[u8], context: &[u8]) -> Result<Vec<u8>> {
        let material = self.material(key).await?;
        crypto::decrypt(&material, ciphertext, context)
    }

    async fn schedule_deletion(&self, name: &str) -> Result<()> {
        let mut keys = self.keys.lock().await;
        let stored = keys
            .get_mut(name)
            .ok_or_else(|| Error::Backend(format!("key {name} not found")))?;
        stored.pending_deletion = true;
        Ok(())
    }
}
