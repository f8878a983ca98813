//! Stuck-node detection and recovery.
//!
//! A node that overstays a phase's timeout gets its server deleted and its
//! status entry removed; the healer recreates it on a later cycle if the
//! desired count still calls for it. The timeout table applies uniformly,
//! control planes included: a member wedged that long is treated as lost,
//! and the healer's quorum guard still protects replacement decisions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::crd::{NodePhase, NodeStatus, TalosClusterStatus};
use crate::engine::Engine;
use crate::error::Result;
use crate::events::{reason, EventSink};

/// How long a node may sit in a phase before it counts as stuck. Phases
/// without an entry, `Ready` and `Failed` included, are never stuck.
#[must_use]
pub fn phase_timeout(phase: NodePhase) -> Option<Duration> {
    let minutes = match phase {
        NodePhase::CreatingServer => 10,
        NodePhase::WaitingForIP => 5,
        NodePhase::WaitingForTalosAPI => 10,
        NodePhase::ApplyingTalosConfig => 10,
        NodePhase::RebootingWithConfig => 10,
        NodePhase::WaitingForK8s => 15,
        NodePhase::NodeInitializing => 10,
        NodePhase::Draining => 15,
        NodePhase::RemovingFromEtcd => 5,
        NodePhase::DeletingServer => 5,
        _ => return None,
    };
    Some(Duration::from_secs(minutes * 60))
}

/// Whether a node has overstayed its current phase.
#[must_use]
pub fn is_stuck(node: &NodeStatus, now: DateTime<Utc>) -> bool {
    let Some(timeout) = phase_timeout(node.phase) else {
        return false;
    };
    let Some(since) = node.phase_transition_time else {
        return false;
    };
    (now - since).num_seconds() > i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX)
}

impl Engine {
    /// Sweep both node groups for stuck nodes; delete their servers (best
    /// effort) and clear them from status.
    pub async fn run_watchdog(
        &self,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
    ) -> Result<()> {
        let now = Utc::now();

        let stuck: Vec<(String, NodePhase)> = status
            .all_nodes()
            .filter(|n| is_stuck(n, now))
            .map(|n| (n.name.clone(), n.phase))
            .collect();

        for (name, phase) in stuck {
            warn!(node = %name, phase = %phase, "Node stuck, recovering");
            events
                .warning(
                    reason::NODE_STUCK,
                    &format!("node {name} stuck in {phase}, deleting server"),
                )
                .await;

            if let Err(e) = self.cloud()?.delete_server(&name).await {
                warn!(node = %name, error = %e, "Stuck-node server deletion failed");
            } else {
                info!(node = %name, "Stuck-node server deleted");
            }

            status.remove_node(&name);
        }

        Ok(())
    }
}
