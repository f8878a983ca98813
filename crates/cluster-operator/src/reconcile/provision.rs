//! Node lifecycle: drive a single new node from spec to `Ready`.

use std::time::Duration;

use chrono::Utc;
use hcloud::{CloudError, CreateServerOpts};
use talos::{MachineRole, NodeConfigParams};
use tracing::{info, warn};

use crate::cluster_state::{self, ResolvedClusterState};
use crate::crd::{NodePhase, NodeRole, NodeStatus, TalosCluster, TalosClusterStatus};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::{reason, EventSink};
use crate::naming;
use crate::reconcile::nodes::set_node_phase;
use crate::reconcile::status::StatusPersister;

/// Tick for the public-IP poll.
const IP_POLL_MILLIS: u64 = 500;

/// Tick for the maintenance-mode poll.
const TALOS_API_POLL_SECS: u64 = 10;

/// Bound on the maintenance-mode wait.
const TALOS_API_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Everything needed to provision one server.
#[derive(Debug, Clone)]
pub struct ProvisionSpec {
    pub cluster_name: String,
    pub role: NodeRole,
    pub server_name: String,
    /// Normalized provider type name.
    pub server_type: String,
    pub region: String,
    pub snapshot_id: i64,
    /// Pre-existing keys plus the batch's ephemeral key.
    pub ssh_key_ids: Vec<i64>,
    pub state: ResolvedClusterState,
    pub pod_cidr: Option<String>,
}

impl From<NodeRole> for MachineRole {
    fn from(role: NodeRole) -> Self {
        match role {
            NodeRole::ControlPlane => Self::ControlPlane,
            NodeRole::Worker => Self::Worker,
        }
    }
}

impl Engine {
    /// Resolve the Talos snapshot image for a cluster.
    pub async fn resolve_snapshot(&self, cluster: &TalosCluster) -> Result<i64> {
        let mut selector = "os=talos".to_string();
        if let Some(version) = &cluster.spec.talos_version {
            selector.push_str(&format!(",version={version}"));
        }

        self.cloud()?
            .get_snapshot_by_labels(&selector)
            .await?
            .map(|image| image.id)
            .ok_or_else(|| Error::Config(format!("no snapshot matches labels {selector}")))
    }

    /// Provision `count` nodes of one role through the full pipeline,
    /// acquiring a single ephemeral SSH key for the batch. Control planes
    /// must be provisioned with `count` calls of 1 when sequencing matters.
    #[allow(clippy::too_many_arguments)]
    pub async fn provision_role_batch(
        &self,
        cluster: &TalosCluster,
        cluster_name: &str,
        status: &mut TalosClusterStatus,
        role: NodeRole,
        count: u32,
        events: &dyn EventSink,
        persist: &dyn StatusPersister,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let cloud = self.cloud()?.clone();
        let state = cluster_state::resolve(&cloud, cluster, cluster_name).await?;
        let snapshot_id = self.resolve_snapshot(cluster).await?;

        let group_spec = match role {
            NodeRole::ControlPlane => &cluster.spec.control_planes,
            NodeRole::Worker => &cluster.spec.workers,
        };
        let server_type = naming::normalize_server_type(&group_spec.server_type).to_string();
        let pod_cidr = cluster.spec.network.pod_cidr.clone();

        cluster_state::with_ephemeral_key(&cloud, cluster_name, role, |key_id| async move {
            for _ in 0..count {
                let mut ssh_key_ids = state.ssh_key_ids.clone();
                ssh_key_ids.push(key_id);

                let spec = ProvisionSpec {
                    cluster_name: cluster_name.to_string(),
                    role,
                    server_name: naming::for_role(cluster_name, role),
                    server_type: server_type.clone(),
                    region: cluster.spec.region.clone(),
                    snapshot_id,
                    ssh_key_ids,
                    state: state.clone(),
                    pod_cidr: pod_cidr.clone(),
                };

                self.provision_node(cluster, status, spec, events, persist)
                    .await?;
            }
            Ok(())
        })
        .await
    }

    /// Run the provisioning pipeline for one node.
    ///
    /// Failures before the machine config lands delete the orphaned server
    /// and clear the node from status. Once a control plane's config has
    /// been applied it has joined etcd; from that point the server is never
    /// deleted here, whatever happens.
    pub async fn provision_node(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        spec: ProvisionSpec,
        events: &dyn EventSink,
        persist: &dyn StatusPersister,
    ) -> Result<()> {
        let name = spec.server_name.clone();
        let cloud = self.cloud()?.clone();

        status
            .group_mut(spec.role)
            .nodes
            .push(NodeStatus::new(&name, spec.role, Utc::now()));

        info!(node = %name, role = %spec.role, "Provisioning node");

        let opts = CreateServerOpts {
            name: name.clone(),
            image: spec.snapshot_id,
            server_type: spec.server_type.clone(),
            location: spec.region.clone(),
            ssh_keys: spec.ssh_key_ids.clone(),
            labels: naming::server_labels(&spec.cluster_name, spec.role),
            user_data: None,
            placement_group: None,
            network_id: spec.state.network_id,
            private_ip: None,
            enable_public_ipv4: true,
            enable_public_ipv6: false,
        };

        if let Err(e) = cloud.create_server(opts).await {
            events
                .warning(
                    reason::SERVER_CREATION_ERROR,
                    &format!("creating server {name}: {e}"),
                )
                .await;
            // Nothing to clean up: creation itself failed.
            status.remove_node(&name);
            return Err(e.into());
        }

        // Persist the name now so a crash cannot orphan the server into a
        // duplicate creation on the next reconcile.
        persist.persist(cluster, status).await?;
        self.set_phase(status, &name, NodePhase::WaitingForIP, None);

        let public_ip = match self.wait_for_server_ip(&name).await {
            Ok(ip) => ip,
            Err(e) => {
                events
                    .warning(
                        reason::PROVISIONING_ERROR,
                        &format!("server {name} never received an IP: {e}"),
                    )
                    .await;
                self.handle_provisioning_failure(status, &name).await;
                return Err(e);
            }
        };

        let server_id = match cloud.get_server_id(&name).await {
            Ok(id) => id,
            Err(e) => {
                // An unparseable ID is fatal for this node; the server is
                // still pre-config and safe to delete.
                events
                    .warning(
                        reason::PROVISIONING_ERROR,
                        &format!("resolving server ID for {name}: {e}"),
                    )
                    .await;
                self.handle_provisioning_failure(status, &name).await;
                return Err(e.into());
            }
        };

        let private_ip = cloud
            .get_server_by_name(&name)
            .await
            .ok()
            .flatten()
            .and_then(|s| s.private_ip);
        // The private address bypasses the firewall; fall back to public.
        let talos_ip = private_ip.clone().unwrap_or_else(|| public_ip.clone());

        if let Some(node) = status.find_node_mut(&name) {
            node.server_id = server_id;
            node.public_ip = Some(public_ip.clone());
            node.private_ip = private_ip;
            node.talos_ip = Some(talos_ip.clone());
        }
        persist.persist(cluster, status).await?;

        self.set_phase(status, &name, NodePhase::WaitingForTalosAPI, None);
        if let Err(e) = self.wait_for_maintenance_mode(&name, &talos_ip).await {
            events
                .warning(
                    reason::PROVISIONING_ERROR,
                    &format!("node-OS API on {name} never came up: {e}"),
                )
                .await;
            self.handle_provisioning_failure(status, &name).await;
            return Err(e);
        }

        self.set_phase(status, &name, NodePhase::ApplyingTalosConfig, None);

        let sans = match spec.role {
            NodeRole::ControlPlane => {
                let mut sans = spec.state.sans.clone();
                if !sans.contains(&public_ip) {
                    sans.push(public_ip.clone());
                }
                sans
            }
            NodeRole::Worker => Vec::new(),
        };

        let params = NodeConfigParams {
            cluster_name: spec.cluster_name.clone(),
            hostname: name.clone(),
            server_id,
            sans,
            endpoint: spec.state.endpoint.clone(),
            pod_cidr: spec.pod_cidr.clone(),
            private_subnet: Some(spec.state.network_cidr.clone()),
        };

        let config = match self.config_generator.generate(spec.role.into(), &params) {
            Ok(config) => config,
            Err(e) => {
                events
                    .warning(
                        reason::CONFIG_APPLY_ERROR,
                        &format!("generating config for {name}: {e}"),
                    )
                    .await;
                self.handle_provisioning_failure(status, &name).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.talos.apply_config(&talos_ip, &config).await {
            events
                .warning(
                    reason::CONFIG_APPLY_ERROR,
                    &format!("applying config to {name}: {e}"),
                )
                .await;
            self.handle_provisioning_failure(status, &name).await;
            return Err(e.into());
        }

        // Point of no return for control planes: the config has landed and
        // the node joins etcd as it comes up. Deleting the server now could
        // strand an unreachable voting member and break quorum.
        self.set_phase(status, &name, NodePhase::RebootingWithConfig, None);

        match spec.role {
            NodeRole::ControlPlane => {
                match self
                    .talos
                    .wait_for_node_ready(&talos_ip, self.timeouts.node_ready)
                    .await
                {
                    Ok(()) => {
                        self.set_phase(status, &name, NodePhase::NodeInitializing, None);
                    }
                    Err(e) => {
                        events
                            .warning(
                                reason::NODE_READY_TIMEOUT,
                                &format!("control plane {name} not ready, keeping server: {e}"),
                            )
                            .await;
                        self.set_phase(
                            status,
                            &name,
                            NodePhase::WaitingForK8s,
                            Some("readiness wait timed out"),
                        );
                        persist.persist(cluster, status).await?;
                        return Err(e.into());
                    }
                }
            }
            NodeRole::Worker => {
                // After the reboot the node's TLS identity changed; observe
                // readiness through the Kubernetes API instead.
                match self
                    .nodes
                    .wait_node_ready(&name, self.timeouts.node_ready)
                    .await
                {
                    Ok(()) => {
                        self.set_phase(status, &name, NodePhase::NodeInitializing, None);
                    }
                    Err(e) => {
                        events
                            .warning(
                                reason::NODE_READY_TIMEOUT,
                                &format!("worker {name} not ready: {e}"),
                            )
                            .await;
                        self.set_phase(status, &name, NodePhase::Failed, Some("never became ready"));
                        self.handle_provisioning_failure(status, &name).await;
                        return Err(e);
                    }
                }
            }
        }

        persist.persist(cluster, status).await?;
        info!(node = %name, "Node provisioned, waiting for Kubernetes readiness promotion");
        Ok(())
    }

    fn set_phase(
        &self,
        status: &mut TalosClusterStatus,
        name: &str,
        phase: NodePhase,
        phase_reason: Option<&str>,
    ) {
        if let Some(node) = status.find_node_mut(name) {
            set_node_phase(node, phase, phase_reason, Utc::now());
        }
    }

    /// Recover from a pre-config provisioning failure: delete the orphaned
    /// server (best effort) and clear the node from status. The next
    /// reconcile recreates it if the desired count still calls for it.
    pub(crate) async fn handle_provisioning_failure(
        &self,
        status: &mut TalosClusterStatus,
        name: &str,
    ) {
        let Ok(cloud) = self.cloud() else {
            status.remove_node(name);
            return;
        };
        if let Err(e) = cloud.delete_server(name).await {
            warn!(node = %name, error = %e, "Orphaned-server cleanup failed");
        }
        status.remove_node(name);
        status.push_last_error(format!("provisioning of {name} failed"));
    }

    /// Poll the provider for the server's public IP.
    async fn wait_for_server_ip(&self, name: &str) -> Result<String> {
        let cloud = self.cloud()?;
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_millis(IP_POLL_MILLIS));

        loop {
            ticker.tick().await;

            match cloud.get_server_ip(name).await {
                Ok(ip) => return Ok(ip),
                Err(CloudError::NotFound(_)) => {}
                Err(e) if e.is_transient() => {}
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() > self.timeouts.server_ip {
                return Err(Error::WaitTimeout {
                    target: format!("public IP of server {name}"),
                    seconds: self.timeouts.server_ip.as_secs(),
                });
            }
        }
    }

    /// Poll until the node-OS API answers in maintenance mode.
    async fn wait_for_maintenance_mode(&self, name: &str, talos_ip: &str) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(TALOS_API_POLL_SECS));

        loop {
            ticker.tick().await;

            match self.talos.is_node_in_maintenance_mode(talos_ip).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(node = %name, error = %e, "Maintenance probe failed");
                }
            }

            if start.elapsed() > TALOS_API_TIMEOUT {
                return Err(Error::WaitTimeout {
                    target: format!("node-OS API on {name} ({talos_ip})"),
                    seconds: TALOS_API_TIMEOUT.as_secs(),
                });
            }
        }
    }
}
