//! Persisted node identity.
//!
//! The node state records which role the node took and which cluster it
//! belongs to. It is written once, by whoever won the [`NodeLock`], and read
//! by later bootstrap tooling and by the join service.
//!
//! [`NodeLock`]: crate::nodelock::NodeLock

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ResultExt};

/// The role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ControlPlane,
    Worker,
    Unknown,
}

impl Role {
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ControlPlane => "ControlPlane",
            Self::Worker => "Worker",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// The record written to the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    pub role: Role,
    pub owner_id: Vec<u8>,
    pub cluster_id: Vec<u8>,
}

/// Reads and writes the node state at a fixed path.
#[derive(Debug, Clone)]
pub struct NodeStateStore {
    path: PathBuf,
}

impl NodeStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist `state`. Fails if a state file already exists: the record is
    /// immutable once written.
    pub fn write(&self, state: &NodeState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating node state directory")?;
        }
        let json = serde_json::to_vec_pretty(state).context("encoding node state")?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .with_context(|| format!("creating {}", self.path.display()))?;
        file.write_all(&json).context("writing node state")?;
        file.sync_all().context("syncing node state")?;
        Ok(())
    }

    pub fn read(&self) -> Result<NodeState> {
        let raw = fs::read(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        serde_json::from_slice::<NodeState>(&raw).context("decoding node state")
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}
