//! `TalosCluster` Custom Resource Definition.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation overriding control-plane endpoint resolution.
pub const ENDPOINT_ANNOTATION: &str = "infra.platform/control-plane-endpoint";

/// Annotation listing pre-existing SSH key names to attach to every server.
pub const SSH_KEYS_ANNOTATION: &str = "infra.platform/ssh-keys";

/// Capacity of the `lastErrors` ring buffer.
pub const LAST_ERRORS_CAPACITY: usize = 10;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "infra.platform", version = "v1", kind = "TalosCluster")]
#[kube(namespaced)]
#[kube(status = "TalosClusterStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(
    printcolumn = r#"{"name":"Provisioning","type":"string","jsonPath":".status.provisioningPhase"}"#
)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterSpec {
    /// Control plane node group.
    pub control_planes: NodeGroupSpec,
    /// Worker node group.
    pub workers: NodeGroupSpec,
    /// Cloud location (e.g. "fsn1").
    pub region: String,
    /// Private network settings.
    pub network: NetworkSpec,
    /// When true the engine observes but never mutates.
    #[serde(default)]
    pub paused: bool,
    /// Health-check thresholds.
    #[serde(default)]
    pub health_checks: HealthCheckSpec,
    /// Addons to install after the CNI.
    #[serde(default)]
    pub addons: Vec<AddonSpec>,
    /// Set by the one-shot CLI path when it has already created the first
    /// control plane and bootstrapped etcd outside the engine.
    #[serde(default)]
    pub bootstrap: Option<BootstrapMarker>,
    /// Talos version label used when resolving the snapshot image.
    #[serde(default)]
    pub talos_version: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Desired node count.
    pub count: u32,
    /// Server size; either a provider type name or a friendly size that the
    /// size mapping normalizes.
    pub server_type: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Name of the pre-created private network.
    pub name: String,
    /// Pod CIDR override, if any.
    #[serde(default)]
    pub pod_cidr: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    /// Seconds a control plane may stay unhealthy before replacement.
    #[serde(default = "default_unhealthy_seconds")]
    pub etcd_unhealthy_seconds: u32,
    /// Seconds a worker may stay unhealthy before replacement.
    #[serde(default = "default_unhealthy_seconds")]
    pub node_unhealthy_seconds: u32,
}

fn default_unhealthy_seconds() -> u32 {
    300
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            etcd_unhealthy_seconds: default_unhealthy_seconds(),
            node_unhealthy_seconds: default_unhealthy_seconds(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Addon name. "cilium" is the CNI and always installs first.
    pub name: String,
    /// Chart/manifest version, if pinned.
    #[serde(default)]
    pub version: Option<String>,
    /// Free-form values handed to the installer.
    #[serde(default)]
    pub values: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapMarker {
    /// True once the external bootstrap finished.
    #[serde(default)]
    pub completed: bool,
}

/// Coarse cluster phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    #[default]
    Provisioning,
    Running,
    Degraded,
    Healing,
    ScalingUp,
    ScalingDown,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Provisioning => "Provisioning",
            Self::Running => "Running",
            Self::Degraded => "Degraded",
            Self::Healing => "Healing",
            Self::ScalingUp => "ScalingUp",
            Self::ScalingDown => "ScalingDown",
        };
        write!(f, "{s}")
    }
}

/// Fine-grained provisioning phase driving the orchestrator dispatch.
///
/// Unknown values deserialize to [`ProvisioningPhase::Unknown`] so that a
/// downgrade never panics the dispatcher; the orchestrator resets them.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningPhase {
    #[default]
    Pending,
    Infrastructure,
    Image,
    Compute,
    Bootstrap,
    #[serde(rename = "CNI")]
    Cni,
    Addons,
    Configuring,
    Complete,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ProvisioningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Infrastructure => "Infrastructure",
            Self::Image => "Image",
            Self::Compute => "Compute",
            Self::Bootstrap => "Bootstrap",
            Self::Cni => "CNI",
            Self::Addons => "Addons",
            Self::Configuring => "Configuring",
            Self::Complete => "Complete",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Node role within the cluster.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    /// Label value for this role.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ControlPlane => "control-plane",
            Self::Worker => "worker",
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-node lifecycle phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum NodePhase {
    #[default]
    CreatingServer,
    WaitingForIP,
    WaitingForTalosAPI,
    ApplyingTalosConfig,
    RebootingWithConfig,
    WaitingForK8s,
    NodeInitializing,
    Ready,
    Draining,
    RemovingFromEtcd,
    DeletingServer,
    Failed,
    Unhealthy,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreatingServer => "CreatingServer",
            Self::WaitingForIP => "WaitingForIP",
            Self::WaitingForTalosAPI => "WaitingForTalosAPI",
            Self::ApplyingTalosConfig => "ApplyingTalosConfig",
            Self::RebootingWithConfig => "RebootingWithConfig",
            Self::WaitingForK8s => "WaitingForK8s",
            Self::NodeInitializing => "NodeInitializing",
            Self::Ready => "Ready",
            Self::Draining => "Draining",
            Self::RemovingFromEtcd => "RemovingFromEtcd",
            Self::DeletingServer => "DeletingServer",
            Self::Failed => "Failed",
            Self::Unhealthy => "Unhealthy",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

impl NodePhase {
    /// Position within the forward provisioning chain, if a member.
    #[must_use]
    pub fn provisioning_index(self) -> Option<u8> {
        match self {
            Self::CreatingServer => Some(0),
            Self::WaitingForIP => Some(1),
            Self::WaitingForTalosAPI => Some(2),
            Self::ApplyingTalosConfig => Some(3),
            Self::RebootingWithConfig => Some(4),
            Self::WaitingForK8s => Some(5),
            Self::NodeInitializing => Some(6),
            Self::Ready => Some(7),
            _ => None,
        }
    }

    /// Position within the forward decommission chain, if a member.
    #[must_use]
    pub fn decommission_index(self) -> Option<u8> {
        match self {
            Self::Draining => Some(0),
            Self::RemovingFromEtcd => Some(1),
            Self::DeletingServer => Some(2),
            _ => None,
        }
    }

    /// Whether the node is still early in provisioning; the healer defers
    /// creation decisions while any node sits here, to avoid duplicates
    /// born from stale status.
    #[must_use]
    pub fn is_early_provisioning(self) -> bool {
        matches!(
            self,
            Self::CreatingServer
                | Self::WaitingForIP
                | Self::WaitingForTalosAPI
                | Self::ApplyingTalosConfig
        )
    }
}

/// Status of a single tracked node.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Cluster-scoped unique name; also the cloud server name and the
    /// Kubernetes node name.
    pub name: String,
    pub role: NodeRole,
    /// Cloud server ID; 0 until assigned.
    #[serde(default)]
    pub server_id: i64,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub private_ip: Option<String>,
    /// Address the node-OS RPC is reached at: the private IP when present
    /// (bypasses the firewall), else the public IP.
    #[serde(default)]
    pub talos_ip: Option<String>,
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default)]
    pub phase_reason: Option<String>,
    #[serde(default)]
    pub phase_transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub unhealthy_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unhealthy_reason: Option<String>,
}

impl NodeStatus {
    /// Create a node entry at the start of the pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            role,
            server_id: 0,
            public_ip: None,
            private_ip: None,
            talos_ip: None,
            phase: NodePhase::CreatingServer,
            phase_reason: None,
            phase_transition_time: Some(now),
            healthy: false,
            unhealthy_since: None,
            unhealthy_reason: None,
        }
    }
}

/// Status of one node group.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    pub desired: u32,
    pub ready: u32,
    #[serde(default)]
    pub nodes: Vec<NodeStatus>,
}

/// Provider-side infrastructure the cluster runs on.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    #[serde(default)]
    pub network_id: i64,
    #[serde(default)]
    pub load_balancer_id: i64,
    #[serde(default)]
    pub load_balancer_ip: Option<String>,
    #[serde(default)]
    pub firewall_id: Option<i64>,
}

impl InfrastructureStatus {
    /// Whether the pre-condition infrastructure has been observed.
    #[must_use]
    pub fn populated(&self) -> bool {
        self.network_id != 0 && self.load_balancer_id != 0
    }
}

/// Installation status of one addon.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    pub name: String,
    #[serde(default)]
    pub installed: bool,
    #[serde(default)]
    pub healthy: bool,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// One closed (or open) record in the phase history.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub phase: ProvisioningPhase,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cluster condition, Kubernetes style.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCondition {
    /// Type of condition, e.g. "ControlPlaneReady".
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True", "False" or "Unknown".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TalosClusterStatus {
    #[serde(default)]
    pub phase: ClusterPhase,
    #[serde(default)]
    pub provisioning_phase: ProvisioningPhase,
    #[serde(default)]
    pub control_plane_endpoint: Option<String>,
    #[serde(default)]
    pub control_planes: NodeGroupStatus,
    #[serde(default)]
    pub workers: NodeGroupStatus,
    #[serde(default)]
    pub infrastructure: InfrastructureStatus,
    #[serde(default)]
    pub addons: Vec<AddonStatus>,
    #[serde(default)]
    pub phase_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
    /// Ring buffer of recent errors, oldest first, capacity 10.
    #[serde(default)]
    pub last_errors: Vec<String>,
    #[serde(default)]
    pub last_reconcile_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub conditions: Vec<ClusterCondition>,
}

impl TalosClusterStatus {
    /// Append to the error ring, evicting the oldest beyond capacity.
    pub fn push_last_error(&mut self, error: impl Into<String>) {
        self.last_errors.push(error.into());
        while self.last_errors.len() > LAST_ERRORS_CAPACITY {
            self.last_errors.remove(0);
        }
    }

    /// All tracked nodes across both groups.
    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeStatus> {
        self.control_planes.nodes.iter().chain(self.workers.nodes.iter())
    }

    /// Find a node by name in either group.
    #[must_use]
    pub fn find_node(&self, name: &str) -> Option<&NodeStatus> {
        self.all_nodes().find(|n| n.name == name)
    }

    /// Find a node by name in either group, mutably.
    pub fn find_node_mut(&mut self, name: &str) -> Option<&mut NodeStatus> {
        self.control_planes
            .nodes
            .iter_mut()
            .chain(self.workers.nodes.iter_mut())
            .find(|n| n.name == name)
    }

    /// Mutable access to the group list for a role.
    pub fn group_mut(&mut self, role: NodeRole) -> &mut NodeGroupStatus {
        match role {
            NodeRole::ControlPlane => &mut self.control_planes,
            NodeRole::Worker => &mut self.workers,
        }
    }

    /// Remove a node entry by name from whichever group holds it.
    pub fn remove_node(&mut self, name: &str) {
        self.control_planes.nodes.retain(|n| n.name != name);
        self.workers.nodes.retain(|n| n.name != name);
    }

    /// Set a condition, updating the transition time only on status change.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: &str,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if existing.status != status {
                existing.last_transition_time = Some(now);
            }
            existing.status = status.to_string();
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
        } else {
            self.conditions.push(ClusterCondition {
                condition_type: condition_type.to_string(),
                status: status.to_string(),
                last_transition_time: Some(now),
                reason: Some(reason.to_string()),
                message: Some(message.to_string()),
            });
        }
    }
}

impl TalosCluster {
    /// Whether the one-shot CLI bootstrap already ran.
    #[must_use]
    pub fn bootstrap_completed(&self) -> bool {
        self.spec.bootstrap.as_ref().is_some_and(|b| b.completed)
    }

    /// Endpoint override from the recognized annotation, if present.
    #[must_use]
    pub fn endpoint_override(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ENDPOINT_ANNOTATION))
            .map(String::as_str)
    }

    /// Pre-existing SSH key names from the recognized annotation.
    #[must_use]
    pub fn ssh_key_names(&self) -> Vec<String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(SSH_KEYS_ANNOTATION))
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_errors_ring_evicts_oldest() {
        let mut status = TalosClusterStatus::default();
        for i in 0..15 {
            status.push_last_error(format!("error-{i}"));
        }
        assert_eq!(status.last_errors.len(), LAST_ERRORS_CAPACITY);
        assert_eq!(status.last_errors.first().unwrap(), "error-5");
        assert_eq!(status.last_errors.last().unwrap(), "error-14");
    }

    #[test]
    fn test_provisioning_phase_unknown_roundtrip() {
        let phase: ProvisioningPhase = serde_json::from_str("\"SomeFuturePhase\"").unwrap();
        assert_eq!(phase, ProvisioningPhase::Unknown);

        let phase: ProvisioningPhase = serde_json::from_str("\"CNI\"").unwrap();
        assert_eq!(phase, ProvisioningPhase::Cni);
    }

    #[test]
    fn test_node_phase_chain_indices() {
        assert!(NodePhase::CreatingServer.provisioning_index() < NodePhase::Ready.provisioning_index());
        assert_eq!(NodePhase::Draining.decommission_index(), Some(0));
        assert_eq!(NodePhase::Failed.provisioning_index(), None);
        assert_eq!(NodePhase::Failed.decommission_index(), None);
    }

    #[test]
    fn test_infrastructure_populated() {
        let mut infra = InfrastructureStatus::default();
        assert!(!infra.populated());
        infra.network_id = 99;
        infra.load_balancer_id = 12;
        assert!(infra.populated());
    }

    #[test]
    fn test_condition_transition_time_stable() {
        let mut status = TalosClusterStatus::default();
        let t1 = Utc::now();
        status.set_condition("ControlPlaneReady", "False", "QuorumLost", "1 of 3", t1);
        let t2 = t1 + chrono::Duration::seconds(30);
        status.set_condition("ControlPlaneReady", "False", "QuorumLost", "1 of 3", t2);
        assert_eq!(
            status.conditions[0].last_transition_time,
            Some(t1),
            "unchanged status must keep its transition time"
        );

        let t3 = t2 + chrono::Duration::seconds(30);
        status.set_condition("ControlPlaneReady", "True", "Healthy", "3 of 3", t3);
        assert_eq!(status.conditions[0].last_transition_time, Some(t3));
    }

    #[test]
    fn test_ssh_key_annotation_parsing() {
        let mut cluster = TalosCluster::new(
            "demo",
            TalosClusterSpec {
                control_planes: NodeGroupSpec {
                    count: 1,
                    server_type: "cpx31".to_string(),
                },
                workers: NodeGroupSpec {
                    count: 1,
                    server_type: "cpx31".to_string(),
                },
                region: "fsn1".to_string(),
                network: NetworkSpec {
                    name: "demo-net".to_string(),
                    pod_cidr: None,
                },
                paused: false,
                health_checks: HealthCheckSpec::default(),
                addons: Vec::new(),
                bootstrap: None,
                talos_version: None,
            },
        );
        cluster.metadata.annotations = Some(BTreeMap::from([(
            SSH_KEYS_ANNOTATION.to_string(),
            "ops-key, backup-key,".to_string(),
        )]));

        assert_eq!(cluster.ssh_key_names(), vec!["ops-key", "backup-key"]);
    }
}
