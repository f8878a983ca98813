//! Phase orchestration: the top-level provisioning state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use tracing::{info, warn};

use crate::addons::CNI_ADDON;
use crate::cluster_state::load_balancer_name;
use crate::crd::{
    AddonSpec, AddonStatus, NodeRole, PhaseRecord, ProvisioningPhase, TalosCluster,
    TalosClusterStatus,
};
use crate::engine::{Engine, DEFAULT_REQUEUE};
use crate::error::{Error, Result};
use crate::events::{reason, EventSink};
use crate::reconcile::status::{refresh_group_counters, StatusPersister};

/// What a phase handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Move to the next phase and requeue immediately.
    Transition(ProvisioningPhase),
    /// Stay put and retry after the default interval.
    Retry,
}

/// Expected wall-clock duration of each phase. Exceeding twice this emits
/// a `PhaseTimeout` warning; recovery belongs to the stuck-node watchdog.
#[must_use]
pub fn expected_phase_duration(phase: ProvisioningPhase) -> Option<Duration> {
    let minutes = match phase {
        ProvisioningPhase::Infrastructure => 2,
        ProvisioningPhase::Image => 1,
        ProvisioningPhase::Compute => 20,
        ProvisioningPhase::Bootstrap => 10,
        ProvisioningPhase::Cni => 10,
        ProvisioningPhase::Addons => 10,
        ProvisioningPhase::Configuring => 5,
        _ => return None,
    };
    Some(Duration::from_secs(minutes * 60))
}

/// Close the open history record and open one for `next`.
pub fn enter_phase(status: &mut TalosClusterStatus, next: ProvisioningPhase, now: DateTime<Utc>) {
    if let Some(open) = status
        .phase_history
        .iter_mut()
        .rev()
        .find(|r| r.ended_at.is_none())
    {
        open.ended_at = Some(now);
        open.duration_seconds = Some((now - open.started_at).num_seconds());
    }

    status.phase_history.push(PhaseRecord {
        phase: next,
        started_at: now,
        ended_at: None,
        duration_seconds: None,
        error: None,
    });
    status.provisioning_phase = next;
    status.phase_started_at = Some(now);

    info!(phase = %next, "Entering provisioning phase");
}

/// Stamp the open history record with an error message.
fn record_phase_error(status: &mut TalosClusterStatus, message: &str) {
    if let Some(open) = status
        .phase_history
        .iter_mut()
        .rev()
        .find(|r| r.ended_at.is_none())
    {
        open.error = Some(message.to_string());
    }
    status.push_last_error(message.to_string());
}

fn first_control_plane_ip(status: &TalosClusterStatus) -> Option<String> {
    status
        .control_planes
        .nodes
        .iter()
        .find_map(|n| n.talos_ip.clone())
}

fn addon_status_mut<'a>(
    status: &'a mut TalosClusterStatus,
    addon: &AddonSpec,
) -> &'a mut AddonStatus {
    let idx = match status.addons.iter().position(|a| a.name == addon.name) {
        Some(idx) => idx,
        None => {
            status.addons.push(AddonStatus {
                name: addon.name.clone(),
                installed: false,
                healthy: false,
                version: addon.version.clone(),
                message: None,
            });
            status.addons.len() - 1
        }
    };
    &mut status.addons[idx]
}

impl Engine {
    /// One orchestration step: dispatch on the provisioning phase, apply
    /// the handler's outcome, and say when to reconcile next.
    pub async fn orchestrate(
        &self,
        cluster: &TalosCluster,
        cluster_name: &str,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
        persist: &dyn StatusPersister,
    ) -> Result<Action> {
        let now = Utc::now();
        let phase = status.provisioning_phase;

        match phase {
            ProvisioningPhase::Pending => {
                // An externally bootstrapped cluster already has compute and
                // etcd; pick up at the CNI.
                let next = if cluster.bootstrap_completed() {
                    ProvisioningPhase::Cni
                } else {
                    ProvisioningPhase::Infrastructure
                };
                enter_phase(status, next, now);
                return Ok(Action::requeue(Duration::ZERO));
            }
            ProvisioningPhase::Unknown => {
                warn!("Unknown provisioning phase, resetting to Infrastructure");
                enter_phase(status, ProvisioningPhase::Infrastructure, now);
                return Ok(Action::requeue(Duration::ZERO));
            }
            ProvisioningPhase::Complete => {
                self.verify_cluster(cluster, cluster_name, status).await?;
                self.run_watchdog(status, events).await?;
                self.run_heal_cycle(cluster, cluster_name, status, events, persist)
                    .await?;
                return Ok(Action::requeue(DEFAULT_REQUEUE));
            }
            _ => {}
        }

        self.check_phase_timeout(status, events, now).await;

        let outcome = match phase {
            ProvisioningPhase::Infrastructure => self.phase_infrastructure(cluster, cluster_name, status).await,
            ProvisioningPhase::Image => self.phase_image(cluster).await,
            ProvisioningPhase::Compute => {
                self.phase_compute(cluster, cluster_name, status, events, persist)
                    .await
            }
            ProvisioningPhase::Bootstrap => self.phase_bootstrap(status).await,
            ProvisioningPhase::Cni => self.phase_cni(cluster, status, events).await,
            ProvisioningPhase::Addons => self.phase_addons(cluster, status, events).await,
            ProvisioningPhase::Configuring => self.phase_configuring(cluster, status).await,
            // Handled above.
            ProvisioningPhase::Pending
            | ProvisioningPhase::Unknown
            | ProvisioningPhase::Complete => Ok(PhaseOutcome::Retry),
        };

        match outcome {
            Ok(PhaseOutcome::Transition(next)) => {
                enter_phase(status, next, Utc::now());
                Ok(Action::requeue(Duration::ZERO))
            }
            Ok(PhaseOutcome::Retry) => Ok(Action::requeue(DEFAULT_REQUEUE)),
            Err(e) => {
                let message = format!("phase {phase} failed: {e}");
                warn!("{message}");
                events.warning(reason::PROVISIONING_ERROR, &message).await;
                record_phase_error(status, &message);
                Ok(Action::requeue(DEFAULT_REQUEUE))
            }
        }
    }

    /// Emit a `PhaseTimeout` warning once the phase overstays twice its
    /// expected duration. Observability only; the watchdog recovers nodes.
    async fn check_phase_timeout(
        &self,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
        now: DateTime<Utc>,
    ) {
        let phase = status.provisioning_phase;
        let (Some(expected), Some(started)) =
            (expected_phase_duration(phase), status.phase_started_at)
        else {
            return;
        };

        let elapsed = (now - started).num_seconds();
        let limit = i64::try_from(expected.as_secs()).unwrap_or(i64::MAX) * 2;
        if elapsed > limit {
            let message =
                format!("phase {phase} running for {elapsed}s, expected under {limit}s");
            events.warning(reason::PHASE_TIMEOUT, &message).await;
            status.push_last_error(message);
        }
    }

    /// Infrastructure is a pre-condition created outside the engine; this
    /// phase only observes it into status.
    async fn phase_infrastructure(
        &self,
        cluster: &TalosCluster,
        cluster_name: &str,
        status: &mut TalosClusterStatus,
    ) -> Result<PhaseOutcome> {
        let cloud = self.cloud()?;

        let Some(network) = cloud.get_network(&cluster.spec.network.name).await? else {
            info!(network = %cluster.spec.network.name, "Waiting for network");
            return Ok(PhaseOutcome::Retry);
        };

        let lb_name = load_balancer_name(cluster_name);
        let Some(lb) = cloud.get_load_balancer(&lb_name).await? else {
            info!(lb = %lb_name, "Waiting for load balancer");
            return Ok(PhaseOutcome::Retry);
        };

        status.infrastructure.network_id = network.id;
        status.infrastructure.load_balancer_id = lb.id;
        status.infrastructure.load_balancer_ip = lb.public_ipv4.clone();

        let endpoint_ip = cluster
            .endpoint_override()
            .map(ToString::to_string)
            .or(lb.public_ipv4)
            .ok_or_else(|| Error::Config(format!("load balancer {lb_name} has no public IP")))?;
        status.control_plane_endpoint = Some(format!("https://{endpoint_ip}:6443"));

        Ok(PhaseOutcome::Transition(ProvisioningPhase::Image))
    }

    /// Wait until the Talos snapshot image is available.
    async fn phase_image(&self, cluster: &TalosCluster) -> Result<PhaseOutcome> {
        match self.resolve_snapshot(cluster).await {
            Ok(id) => {
                info!(snapshot = id, "Snapshot resolved");
                Ok(PhaseOutcome::Transition(ProvisioningPhase::Compute))
            }
            Err(Error::Config(_)) => Ok(PhaseOutcome::Retry),
            Err(e) => Err(e),
        }
    }

    /// Create the initial compute: control planes one at a time, then
    /// workers in bounded batches. Re-dispatching with counts satisfied
    /// makes no provider calls.
    async fn phase_compute(
        &self,
        cluster: &TalosCluster,
        cluster_name: &str,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
        persist: &dyn StatusPersister,
    ) -> Result<PhaseOutcome> {
        refresh_group_counters(cluster, status);

        let cp_missing = cluster
            .spec
            .control_planes
            .count
            .saturating_sub(u32::try_from(status.control_planes.nodes.len()).unwrap_or(u32::MAX));
        for _ in 0..cp_missing {
            self.provision_role_batch(
                cluster,
                cluster_name,
                status,
                NodeRole::ControlPlane,
                1,
                events,
                persist,
            )
            .await?;
        }

        let worker_missing = cluster
            .spec
            .workers
            .count
            .saturating_sub(u32::try_from(status.workers.nodes.len()).unwrap_or(u32::MAX));
        let batch = worker_missing.min(self.max_concurrent_heals);
        if batch > 0 {
            self.provision_role_batch(
                cluster,
                cluster_name,
                status,
                NodeRole::Worker,
                batch,
                events,
                persist,
            )
            .await?;
        }

        if worker_missing > batch {
            return Ok(PhaseOutcome::Retry);
        }
        Ok(PhaseOutcome::Transition(ProvisioningPhase::Bootstrap))
    }

    /// Bootstrap etcd on the first control plane and wait for the API.
    async fn phase_bootstrap(&self, status: &mut TalosClusterStatus) -> Result<PhaseOutcome> {
        let Some(ip) = first_control_plane_ip(status) else {
            return Ok(PhaseOutcome::Retry);
        };

        self.talos.bootstrap(&ip).await?;
        self.talos
            .wait_for_node_ready(&ip, self.timeouts.node_ready)
            .await?;

        Ok(PhaseOutcome::Transition(ProvisioningPhase::Cni))
    }

    /// Install the CNI and wait for it. The follow-up phase depends on the
    /// bootstrap marker: an externally bootstrapped cluster still needs its
    /// remaining compute created by the operator's owner, so control
    /// returns to Compute; otherwise compute already exists and the
    /// remaining addons are next.
    async fn phase_cni(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
    ) -> Result<PhaseOutcome> {
        let next = if cluster.bootstrap_completed() {
            ProvisioningPhase::Compute
        } else {
            ProvisioningPhase::Addons
        };

        let Some(addon) = cluster.spec.addons.iter().find(|a| a.name == CNI_ADDON) else {
            info!("No CNI addon in spec, skipping installation");
            return Ok(PhaseOutcome::Transition(next));
        };

        let Some(ip) = first_control_plane_ip(status) else {
            return Ok(PhaseOutcome::Retry);
        };
        let kubeconfig = self.talos.kubeconfig(&ip).await?;

        if let Err(e) = self.addons.install(&kubeconfig, addon).await {
            events
                .warning(
                    reason::ADDON_INSTALL_ERROR,
                    &format!("installing {}: {e}", addon.name),
                )
                .await;
            let entry = addon_status_mut(status, addon);
            entry.installed = false;
            entry.message = Some(e.to_string());
            return Err(e);
        }

        let healthy = self.addons.is_healthy(&kubeconfig, addon).await?;
        let entry = addon_status_mut(status, addon);
        entry.installed = true;
        entry.healthy = healthy;
        entry.message = None;

        if healthy {
            Ok(PhaseOutcome::Transition(next))
        } else {
            Ok(PhaseOutcome::Retry)
        }
    }

    /// Install every post-CNI addon in spec order.
    async fn phase_addons(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
        events: &dyn EventSink,
    ) -> Result<PhaseOutcome> {
        let pending: Vec<AddonSpec> = cluster
            .spec
            .addons
            .iter()
            .filter(|a| a.name != CNI_ADDON)
            .filter(|a| {
                !status
                    .addons
                    .iter()
                    .any(|s| s.name == a.name && s.installed)
            })
            .cloned()
            .collect();

        if pending.is_empty() {
            return Ok(PhaseOutcome::Transition(ProvisioningPhase::Configuring));
        }

        let Some(ip) = first_control_plane_ip(status) else {
            return Ok(PhaseOutcome::Retry);
        };
        let kubeconfig = self.talos.kubeconfig(&ip).await?;

        for addon in pending {
            match self.addons.install(&kubeconfig, &addon).await {
                Ok(()) => {
                    let healthy = self.addons.is_healthy(&kubeconfig, &addon).await?;
                    let entry = addon_status_mut(status, &addon);
                    entry.installed = true;
                    entry.healthy = healthy;
                    entry.message = None;
                }
                Err(e) => {
                    events
                        .warning(
                            reason::ADDON_INSTALL_ERROR,
                            &format!("installing {}: {e}", addon.name),
                        )
                        .await;
                    let entry = addon_status_mut(status, &addon);
                    entry.installed = false;
                    entry.message = Some(e.to_string());
                    return Err(e);
                }
            }
        }

        Ok(PhaseOutcome::Transition(ProvisioningPhase::Configuring))
    }

    /// Final gate before Complete: infrastructure observed and every
    /// desired addon installed and healthy.
    async fn phase_configuring(
        &self,
        cluster: &TalosCluster,
        status: &mut TalosClusterStatus,
    ) -> Result<PhaseOutcome> {
        if !status.infrastructure.populated() {
            return Ok(PhaseOutcome::Retry);
        }

        if !cluster.spec.addons.is_empty() {
            let Some(ip) = first_control_plane_ip(status) else {
                return Ok(PhaseOutcome::Retry);
            };
            let kubeconfig = self.talos.kubeconfig(&ip).await?;

            for addon in &cluster.spec.addons {
                let healthy = self.addons.is_healthy(&kubeconfig, addon).await?;
                let entry = addon_status_mut(status, addon);
                entry.healthy = healthy;
                if !(entry.installed && healthy) {
                    return Ok(PhaseOutcome::Retry);
                }
            }
        }

        Ok(PhaseOutcome::Transition(ProvisioningPhase::Complete))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_durations_cover_active_phases() {
        for phase in [
            ProvisioningPhase::Infrastructure,
            ProvisioningPhase::Image,
            ProvisioningPhase::Compute,
            ProvisioningPhase::Bootstrap,
            ProvisioningPhase::Cni,
            ProvisioningPhase::Addons,
            ProvisioningPhase::Configuring,
        ] {
            assert!(expected_phase_duration(phase).is_some(), "{phase} needs one");
        }
        assert!(expected_phase_duration(ProvisioningPhase::Complete).is_none());
        assert!(expected_phase_duration(ProvisioningPhase::Pending).is_none());
        assert!(expected_phase_duration(ProvisioningPhase::Unknown).is_none());
    }

    #[test]
    fn test_enter_phase_closes_previous_record() {
        let mut status = TalosClusterStatus::default();
        let t0 = Utc::now();
        enter_phase(&mut status, ProvisioningPhase::Infrastructure, t0);

        let t1 = t0 + chrono::Duration::seconds(90);
        enter_phase(&mut status, ProvisioningPhase::Image, t1);

        assert_eq!(status.phase_history.len(), 2);
        let first = &status.phase_history[0];
        assert_eq!(first.phase, ProvisioningPhase::Infrastructure);
        assert_eq!(first.ended_at, Some(t1));
        assert_eq!(first.duration_seconds, Some(90));

        let second = &status.phase_history[1];
        assert_eq!(second.phase, ProvisioningPhase::Image);
        assert!(second.ended_at.is_none());

        assert_eq!(status.provisioning_phase, ProvisioningPhase::Image);
        assert_eq!(status.phase_started_at, Some(t1));
    }
}
