//! Runtime configuration and protocol constants.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is
//! a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};

/// Length of generated identifiers (cluster ID, owner ID).
pub const RNG_LENGTH_DEFAULT: usize = 32;

/// Length of the state disk passphrase.
pub const STATE_DISK_KEY_LENGTH: usize = 32;

/// Length of symmetric KEKs and DEKs.
pub const SYMMETRIC_KEY_LENGTH: usize = 32;

/// Port the join service listens on, on every control-plane node.
pub const JOIN_SERVICE_PORT: u16 = 30090;

/// Port the init server listens on, on the first node.
pub const INIT_SERVICE_PORT: u16 = 9000;

/// Bootstrapper settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Pause between join-client attempts.
    pub join_interval_secs: u64,
    /// Budget for each outbound call (metadata, dial, RPC).
    pub call_timeout_secs: u64,
    pub join_service_port: u16,
    pub init_service_port: u16,
    /// Where the node state record is persisted.
    pub node_state_path: PathBuf,
    /// KEK the join service wraps state disk keys under.
    pub kek_id: String,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            join_interval_secs: 30,
            call_timeout_secs: 30,
            join_service_port: JOIN_SERVICE_PORT,
            init_service_port: INIT_SERVICE_PORT,
            node_state_path: PathBuf::from("/run/state/bootstrapper/node_state.json"),
            kek_id: "bootstrapper-kek".to_string(),
        }
    }
}

impl BootstrapConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read(path).with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_slice::<Self>(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn join_interval(&self) -> Duration {
        Duration::from_secs(self.join_interval_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}
