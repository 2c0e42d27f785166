//! Join client.
//!
//! Runs on every booting node that is not the first one. In the background it
//! learns its own name and role from the metadata API, then repeatedly asks
//! the control-plane nodes' join services for a [`JoinTicket`] until one
//! answers. The ticket's disk key becomes the state disk passphrase and the
//! node joins Kubernetes.
//!
//! ```text
//! Idle -> DiscoveringMetadata -> AttemptingJoin -> Joined
//!                  |                    |       -> Unrecoverable
//!                  +--------------------+--------> Stopped
//! ```
//!
//! Everything after the node lock is taken is unrecoverable: a half-joined
//! node must not try again with a different ticket.
//!
//! Each control-plane peer gets one timeout budget covering the dial, the
//! evidence, the ticket RPC and the Kubernetes join. Running out before the
//! lock is taken moves on to the next peer; running out after it is
//! unrecoverable.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::attestation::{join_user_data, Issuer};
use crate::config::BootstrapConfig;
use crate::disk::{self, EncryptedDisk};
use crate::error::{Error, Result, ResultExt};
use crate::joinproto::{ActivationRequest, Dialer, JoinTicket};
use crate::metadata::{control_plane_ips, MetadataApi};
use crate::nodelock::NodeLock;
use crate::nodestate::{NodeState, NodeStateStore, Role};

/// Where the join client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinPhase {
    Idle,
    DiscoveringMetadata,
    AttemptingJoin,
    Joined,
    Stopped,
    Unrecoverable,
}

impl JoinPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Joined | Self::Stopped | Self::Unrecoverable)
    }
}

/// Outcome classification of one join attempt.
#[derive(Debug, Error)]
pub enum JoinError {
    /// Try again after the interval.
    #[error("{0}")]
    Retryable(#[source] Error),
    /// Give up for good.
    #[error("unrecoverable: {0}")]
    Unrecoverable(#[source] Error),
}

/// Kubeadm-style discovery parameters for a bootstrap token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapTokenDiscovery {
    pub api_server_endpoint: String,
    pub token: String,
    pub ca_cert_hashes: Vec<String>,
}

/// Kubelet client key and certificate issued to a joining node.
#[derive(Clone, PartialEq, Eq)]
pub struct KubeletCredentials {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

/// Joins the node to the Kubernetes cluster once a ticket is in hand.
#[async_trait]
pub trait ClusterJoiner: Send + Sync {
    async fn join_cluster(
        &self,
        discovery: &BootstrapTokenDiscovery,
        kubelet: &KubeletCredentials,
        certificate_key: Option<&str>,
        role: Role,
    ) -> Result<()>;
}

/// External collaborators of a [`JoinClient`].
pub struct JoinClientDeps {
    pub lock: Arc<NodeLock>,
    pub dialer: Arc<dyn Dialer>,
    pub joiner: Arc<dyn ClusterJoiner>,
    pub metadata: Arc<dyn MetadataApi>,
    pub disk: Arc<dyn EncryptedDisk>,
    pub issuer: Arc<dyn Issuer>,
    pub node_state: NodeStateStore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NodeIdentity {
    name: String,
    role: Role,
}

enum RunState {
    NotStarted,
    Running {
        stop: watch::Sender<bool>,
        handle: JoinHandle<()>,
    },
    Stopped,
}

pub struct JoinClient {
    inner: Arc<Inner>,
    run: Mutex<RunState>,
}

struct Inner {
    deps: JoinClientDeps,
    interval: Duration,
    timeout: Duration,
    phase: watch::Sender<JoinPhase>,
}

impl JoinClient {
    pub fn new(deps: JoinClientDeps, config: &BootstrapConfig) -> Self {
        Self::with_timing(deps, config.join_interval(), config.call_timeout())
    }

    /// `interval` is the pause between attempts, `timeout` the budget of
    /// each metadata call and of each join attempt at one peer.
    pub fn with_timing(deps: JoinClientDeps, interval: Duration, timeout: Duration) -> Self {
        let (phase, _) = watch::channel(JoinPhase::Idle);
        Self {
            inner: Arc::new(Inner {
                deps,
                interval,
                timeout,
                phase,
            }),
            run: Mutex::new(RunState::NotStarted),
        }
    }

    pub fn phase(&self) -> JoinPhase {
        *self.inner.phase.borrow()
    }

    /// A receiver that observes every phase change.
    pub fn subscribe(&self) -> watch::Receiver<JoinPhase> {
        self.inner.phase.subscribe()
    }

    /// Launch the background loop. Does nothing while a loop is running.
    pub async fn start(&self) {
        let mut run = self.run.lock().await;
        if matches!(*run, RunState::Running { .. }) {
            return;
        }

        info!("starting join client");
        let (stop, stop_rx) = watch::channel(false);
        self.inner.phase.send_replace(JoinPhase::Idle);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(
            async move {
                let phase = inner.run(stop_rx).await;
                inner.phase.send_replace(phase);
                info!(?phase, "join client stopped");
            }
            .instrument(info_span!("joinclient")),
        );
        *run = RunState::Running { stop, handle };
    }

    /// Signal the loop to stop and wait until it has. An attempt in flight
    /// finishes first. Calling `stop` again, or before `start`, is a no-op.
    pub async fn stop(&self) {
        let mut run = self.run.lock().await;
        match std::mem::replace(&mut *run, RunState::Stopped) {
            RunState::Running { stop, handle } => {
                info!("stopping join client");
                // The loop may already be gone; then there is nobody to tell.
                let _ = stop.send(true);
                if let Err(err) = handle.await {
                    error!(error = %err, "join client task failed");
                }
            }
            other => *run = other,
        }
    }
}

impl Inner {
    async fn run(&self, mut stop: watch::Receiver<bool>) -> JoinPhase {
        let disk_uuid = match disk::read_uuid(&self.deps.disk) {
            Ok(uuid) => uuid,
            Err(err) => {
                error!(error = %err, "failed to get disk UUID");
                return JoinPhase::Unrecoverable;
            }
        };

        self.phase.send_replace(JoinPhase::DiscoveringMetadata);
        let identity = loop {
            match self.node_metadata().await {
                Ok(identity) => {
                    info!(role = %identity.role, name = %identity.name, "received own instance metadata");
                    break identity;
                }
                Err(err) => warn!(error = %err, "failed to retrieve instance metadata"),
            }
            if self.sleep_or_stop(&mut stop).await {
                return JoinPhase::Stopped;
            }
        };

        self.phase.send_replace(JoinPhase::AttemptingJoin);
        loop {
            match self.try_join_at_available_services(&disk_uuid, &identity).await {
                Ok(()) => {
                    info!("joined successfully");
                    return JoinPhase::Joined;
                }
                Err(JoinError::Unrecoverable(err)) => {
                    error!(error = %err, "unrecoverable error occurred");
                    return JoinPhase::Unrecoverable;
                }
                Err(JoinError::Retryable(err)) => {
                    warn!(error = %err, "join failed for all available endpoints");
                }
            }
            if self.sleep_or_stop(&mut stop).await {
                return JoinPhase::Stopped;
            }
        }
    }

    /// Returns true if the loop was told to stop.
    async fn sleep_or_stop(&self, stop: &mut watch::Receiver<bool>) -> bool {
        info!(interval = ?self.interval, "sleeping");
        tokio::select! {
            _ = stop.changed() => true,
            _ = tokio::time::sleep(self.interval) => false,
        }
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        self.call_until(Instant::now() + self.timeout, fut).await
    }

    async fn call_until<T>(&self, deadline: Instant, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout_at(deadline, fut)
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
    }

    async fn node_metadata(&self) -> Result<NodeIdentity> {
        let inst = self
            .call(self.deps.metadata.self_instance())
            .await
            .context("requesting own instance metadata")?;
        if inst.name.is_empty() {
            return Err(Error::Metadata("got instance metadata with empty name".into()));
        }
        if !inst.role.is_known() {
            return Err(Error::Metadata("got instance metadata with unknown role".into()));
        }
        Ok(NodeIdentity {
            name: inst.name,
            role: inst.role,
        })
    }

    async fn try_join_at_available_services(
        &self,
        disk_uuid: &str,
        identity: &NodeIdentity,
    ) -> Result<(), JoinError> {
        let instances = self
            .call(self.deps.metadata.list())
            .await
            .context("listing instances from metadata API")
            .map_err(JoinError::Retryable)?;
        let ips = control_plane_ips(&instances);
        info!(?ips, "received control-plane endpoints");

        let mut last = Error::Metadata("no coordinator IPs found".into());
        for ip in &ips {
            let deadline = Instant::now() + self.timeout;
            let ticket = match self.request_ticket(ip, disk_uuid, identity, deadline).await {
                Ok(ticket) => ticket,
                Err(err) => {
                    info!(ip = %ip, error = %err, "join service unavailable");
                    last = err;
                    continue;
                }
            };
            return self
                .start_node_and_join(ticket, identity, deadline)
                .await
                .map_err(JoinError::Unrecoverable);
        }
        Err(JoinError::Retryable(last))
    }

    async fn request_ticket(
        &self,
        ip: &str,
        disk_uuid: &str,
        identity: &NodeIdentity,
        deadline: Instant,
    ) -> Result<JoinTicket> {
        let service = self
            .call_until(deadline, self.deps.dialer.dial(ip))
            .await
            .context("dialing join service")?;

        let user_data = join_user_data(disk_uuid, &identity.name);
        let attestation = self
            .call_until(deadline, self.deps.issuer.issue(&user_data))
            .await
            .context("issuing attestation evidence")?;
        let req = ActivationRequest {
            disk_uuid: disk_uuid.to_string(),
            node_name: identity.name.clone(),
            attestation,
        };

        let ticket = match identity.role {
            Role::Worker => self.call_until(deadline, service.activate_worker_node(&req)).await,
            Role::ControlPlane => {
                self.call_until(deadline, service.activate_control_plane_node(&req))
                    .await
            }
            Role::Unknown => Err(Error::Invalid(format!("cannot activate as {}", Role::Unknown))),
        };
        ticket.context("requesting join ticket")
    }

    async fn start_node_and_join(
        &self,
        ticket: JoinTicket,
        identity: &NodeIdentity,
        deadline: Instant,
    ) -> Result<()> {
        // A node that is being initialized becomes part of the cluster anyway.
        if !self.deps.lock.try_lock_once() {
            return Err(Error::NodeLocked("initialized"));
        }

        disk::set_passphrase(&self.deps.disk, &ticket.state_disk_key)
            .context("updating disk passphrase")?;

        let state = NodeState {
            role: identity.role,
            owner_id: ticket.owner_id,
            cluster_id: ticket.cluster_id,
        };
        self.deps
            .node_state
            .write(&state)
            .context("persisting node state")?;

        let discovery = BootstrapTokenDiscovery {
            api_server_endpoint: ticket.api_server_endpoint,
            token: ticket.token,
            ca_cert_hashes: vec![ticket.discovery_token_ca_cert_hash],
        };
        let kubelet = KubeletCredentials {
            key: ticket.kubelet_key,
            cert: ticket.kubelet_cert,
        };
        let join = self.deps.joiner.join_cluster(
            &discovery,
            &kubelet,
            ticket.certificate_key.as_deref(),
            identity.role,
        );
        self.call_until(deadline, join)
            .await
            .context("joining Kubernetes cluster")
    }
}
