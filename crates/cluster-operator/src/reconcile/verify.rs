//! State verification: reconstruct each node's phase from ground truth.

use chrono::Utc;
use hcloud::ServerStatus;
use tracing::{debug, warn};

use crate::crd::{NodePhase, NodeRole, TalosCluster, TalosClusterStatus};
use crate::engine::Engine;
use crate::error::Result;
use crate::reconcile::nodes::{refresh_health, set_node_phase};
use crate::reconcile::status::refresh_group_counters;

/// Independent evidence gathered for one node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeStateInfo {
    /// The cloud server exists.
    pub server_exists: bool,
    /// Its status, when it exists.
    pub server_status: Option<ServerStatus>,
    /// The node-OS RPC answered at all.
    pub talos_reachable: bool,
    /// The node is up but unconfigured.
    pub maintenance_mode: bool,
    /// A machine config has been accepted.
    pub configured: bool,
    /// The kubelet service is up.
    pub kubelet_running: bool,
    /// The Kubernetes Node object exists.
    pub k8s_node_exists: bool,
    /// Its `Ready` condition is `True`.
    pub k8s_node_ready: bool,
}

/// Derive the most advanced phase the evidence justifies.
///
/// Pure function over [`NodeStateInfo`]; the priority order is fixed and
/// most-advanced-wins.
#[must_use]
pub fn determine_node_phase(info: &NodeStateInfo) -> NodePhase {
    if info.k8s_node_ready {
        return NodePhase::Ready;
    }
    if info.k8s_node_exists {
        if info.kubelet_running {
            return NodePhase::NodeInitializing;
        }
        return NodePhase::WaitingForK8s;
    }
    if info.configured {
        if info.kubelet_running {
            return NodePhase::WaitingForK8s;
        }
        return NodePhase::RebootingWithConfig;
    }
    if info.maintenance_mode {
        return NodePhase::WaitingForTalosAPI;
    }
    if info.talos_reachable {
        return NodePhase::ApplyingTalosConfig;
    }
    match info.server_status {
        Some(ServerStatus::Running) => NodePhase::WaitingForTalosAPI,
        Some(ServerStatus::Starting | ServerStatus::Initializing) => NodePhase::WaitingForIP,
        Some(_) => NodePhase::CreatingServer,
        None => NodePhase::Failed,
    }
}

impl Engine {
    /// Gather evidence for one node. Node-OS probes are best effort with
    /// short timeouts; a probe failure simply leaves its evidence negative.
    async fn gather_node_state(&self, name: &str, talos_ip: Option<&str>) -> Result<NodeStateInfo> {
        let mut info = NodeStateInfo::default();

        let server = self.cloud()?.get_server_by_name(name).await?;
        if let Some(server) = &server {
            info.server_exists = true;
            info.server_status = Some(server.status);
        }

        if let Some(ip) = talos_ip {
            match self.talos.is_node_in_maintenance_mode(ip).await {
                Ok(maintenance) => {
                    info.maintenance_mode = maintenance;
                    if maintenance {
                        info.talos_reachable = true;
                    }
                }
                Err(e) => debug!(node = %name, error = %e, "Maintenance probe failed"),
            }

            match self.talos.service_health(ip).await {
                Ok(state) => {
                    if state.configured {
                        info.talos_reachable = true;
                        info.configured = true;
                    }
                    info.kubelet_running = state.kubelet_running;
                }
                Err(e) => debug!(node = %name, error = %e, "Service probe failed"),
            }
        }

        let view = self.nodes.get_node(name).await.unwrap_or_default();
        info.k8s_node_exists = view.exists;
        info.k8s_node_ready = view.ready;

        Ok(info)
    }

    /// Re-derive every tracked node's phase from ground truth and refresh
    /// the health bookkeeping and group counters.
    pub async fn verify_cluster(
        &self,
        cluster: &TalosCluster,
        cluster_name: &str,
        status: &mut TalosClusterStatus,
    ) -> Result<()> {
        let now = Utc::now();

        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            // Names first: the node list cannot be borrowed across the
            // probe awaits.
            let probes: Vec<(String, Option<String>)> = status
                .group_mut(role)
                .nodes
                .iter()
                .filter(|n| {
                    !matches!(
                        n.phase,
                        NodePhase::Failed | NodePhase::DeletingServer | NodePhase::RemovingFromEtcd
                    )
                })
                .map(|n| (n.name.clone(), n.talos_ip.clone()))
                .collect();

            for (name, talos_ip) in probes {
                let info = match self.gather_node_state(&name, talos_ip.as_deref()).await {
                    Ok(info) => info,
                    Err(e) => {
                        warn!(node = %name, error = %e, "State gathering failed");
                        continue;
                    }
                };

                let derived = determine_node_phase(&info);
                let Some(node) = status
                    .group_mut(role)
                    .nodes
                    .iter_mut()
                    .find(|n| n.name == name)
                else {
                    continue;
                };

                if derived == NodePhase::Failed {
                    set_node_phase(node, NodePhase::Failed, Some("server absent"), now);
                } else if node.phase == NodePhase::Ready && derived != NodePhase::Ready {
                    // Ground truth regressed on a previously ready node.
                    set_node_phase(
                        node,
                        NodePhase::Unhealthy,
                        Some(&format!("observed state degraded to {derived}")),
                        now,
                    );
                } else {
                    set_node_phase(node, derived, None, now);
                }

                refresh_health(node, now);
            }
        }

        refresh_group_counters(cluster, status);

        self.metrics.set_node_counts(
            cluster_name,
            NodeRole::ControlPlane,
            status.control_planes.nodes.len() as i64,
            i64::from(status.control_planes.ready),
            i64::from(status.control_planes.desired),
        );
        self.metrics.set_node_counts(
            cluster_name,
            NodeRole::Worker,
            status.workers.nodes.len() as i64,
            i64::from(status.workers.ready),
            i64::from(status.workers.desired),
        );

        Ok(())
    }
}
