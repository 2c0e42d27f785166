//! Cloud metadata seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::nodestate::Role;

/// What the cloud knows about one instance of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub name: String,
    pub provider_id: String,
    pub role: Role,
    pub private_ips: Vec<String>,
}

/// Provides information about the cluster's instances.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    /// All instances belonging to the cluster.
    async fn list(&self) -> Result<Vec<InstanceMetadata>>;
    /// The instance this process runs on.
    async fn self_instance(&self) -> Result<InstanceMetadata>;
}

/// Private IPs of every control-plane instance, in listing order.
pub fn control_plane_ips(instances: &[InstanceMetadata]) -> Vec<String> {
    instances
        .iter()
        .filter(|inst| inst.role == Role::ControlPlane)
        .flat_map(|inst| inst.private_ips.iter().cloned())
        .collect()
}
