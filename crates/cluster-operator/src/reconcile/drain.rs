//! Node decommissioning: cordon, drain, delete.

use chrono::Utc;
use tracing::{info, warn};

use crate::crd::{NodePhase, TalosClusterStatus};
use crate::engine::Engine;
use crate::error::Result;
use crate::events::{reason, EventSink};
use crate::reconcile::nodes::set_node_phase;

impl Engine {
    /// Decommission one worker: cordon, evict its pods, delete the
    /// Kubernetes node, delete the cloud server, drop the status entry.
    ///
    /// Drain errors are logged and never block removal; a node being
    /// scaled away must not be wedged by a pod that refuses to leave.
    pub async fn decommission_worker(
        &self,
        status: &mut TalosClusterStatus,
        name: &str,
        events: &dyn EventSink,
    ) -> Result<()> {
        info!(node = %name, "Decommissioning worker");
        events
            .normal(reason::SCALING_DOWN, &format!("removing worker {name}"))
            .await;

        if let Some(node) = status.find_node_mut(name) {
            set_node_phase(node, NodePhase::Draining, Some("scale down"), Utc::now());
        }

        if let Err(e) = self.nodes.cordon(name).await {
            warn!(node = %name, error = %e, "Cordon failed");
        }

        match self.nodes.evictable_pods(name).await {
            Ok(pods) => {
                for pod in pods {
                    if let Err(e) = self.nodes.evict_pod(&pod).await {
                        warn!(
                            pod = %pod.name,
                            namespace = %pod.namespace,
                            error = %e,
                            "Pod eviction failed, continuing drain"
                        );
                    }
                }
            }
            Err(e) => warn!(node = %name, error = %e, "Listing pods for drain failed"),
        }

        if let Err(e) = self.nodes.delete_node(name).await {
            warn!(node = %name, error = %e, "Kubernetes node deletion failed");
        }

        if let Some(node) = status.find_node_mut(name) {
            set_node_phase(node, NodePhase::DeletingServer, None, Utc::now());
        }

        if let Err(e) = self.cloud()?.delete_server(name).await {
            warn!(node = %name, error = %e, "Server deletion failed");
        }

        status.remove_node(name);
        Ok(())
    }
}
