//! Role-specific machine-config generation.

use serde::Serialize;

use crate::error::TalosError;

/// Role a machine config is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineRole {
    ControlPlane,
    Worker,
}

impl MachineRole {
    fn as_config_type(self) -> &'static str {
        match self {
            Self::ControlPlane => "controlplane",
            Self::Worker => "worker",
        }
    }
}

/// Per-node inputs to config generation.
#[derive(Debug, Clone, Default)]
pub struct NodeConfigParams {
    /// Cluster name.
    pub cluster_name: String,
    /// Node hostname (the node's server name).
    pub hostname: String,
    /// Cloud server ID, recorded as a node label.
    pub server_id: i64,
    /// TLS SANs for the API server certificate. Control planes only.
    pub sans: Vec<String>,
    /// Stable cluster endpoint, e.g. `https://1.2.3.4:6443`.
    pub endpoint: String,
    /// Pod CIDR override, if any.
    pub pod_cidr: Option<String>,
    /// Private subnet the kubelet and etcd should bind into.
    pub private_subnet: Option<String>,
}

/// Machine-config generation port. Pure so that tests can assert on output.
pub trait ConfigGenerator: Send + Sync {
    /// Render the machine config for one node.
    ///
    /// # Errors
    /// Returns an error if the parameters cannot be rendered.
    fn generate(&self, role: MachineRole, params: &NodeConfigParams)
        -> Result<Vec<u8>, TalosError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineConfigDoc {
    version: &'static str,
    machine: MachineSection,
    cluster: ClusterSection,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MachineSection {
    #[serde(rename = "type")]
    machine_type: &'static str,
    network: NetworkSection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cert_s_a_ns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kubelet: Option<KubeletSection>,
    node_labels: std::collections::BTreeMap<String, String>,
}

#[derive(Serialize)]
struct NetworkSection {
    hostname: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct KubeletSection {
    node_i_p: NodeIpSection,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeIpSection {
    valid_subnets: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    control_plane: Option<ControlPlaneSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<ClusterNetworkSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<ProxySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    etcd: Option<EtcdSection>,
}

#[derive(Serialize)]
struct ControlPlaneSection {
    endpoint: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClusterNetworkSection {
    cni: CniSection,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pod_subnets: Vec<String>,
}

#[derive(Serialize)]
struct CniSection {
    name: &'static str,
}

#[derive(Serialize)]
struct ProxySection {
    disabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EtcdSection {
    advertised_subnets: Vec<String>,
}

/// Node label the cloud server ID is recorded under.
const SERVER_ID_LABEL: &str = "instance.hetzner.cloud/id";

/// Default [`ConfigGenerator`]: Cilium-ready machine configs (no default
/// CNI, kube-proxy disabled) with kubelet and etcd pinned to the private
/// subnet so multi-homed servers never advertise their public address.
#[derive(Debug, Clone, Default)]
pub struct MachineConfigBuilder;

impl ConfigGenerator for MachineConfigBuilder {
    fn generate(
        &self,
        role: MachineRole,
        params: &NodeConfigParams,
    ) -> Result<Vec<u8>, TalosError> {
        if params.hostname.is_empty() {
            return Err(TalosError::ConfigGeneration("hostname is empty".to_string()));
        }
        if role == MachineRole::ControlPlane && params.endpoint.is_empty() {
            return Err(TalosError::ConfigGeneration(
                "control plane config requires an endpoint".to_string(),
            ));
        }

        let kubelet = params.private_subnet.as_ref().map(|subnet| KubeletSection {
            node_i_p: NodeIpSection {
                valid_subnets: vec![subnet.clone()],
            },
        });

        let mut node_labels = std::collections::BTreeMap::new();
        node_labels.insert(SERVER_ID_LABEL.to_string(), params.server_id.to_string());

        // Workers carry the minimum: hostname, server id, subnet pinning.
        // The cluster-wide sections only need to exist on control planes.
        let cluster = match role {
            MachineRole::ControlPlane => ClusterSection {
                control_plane: Some(ControlPlaneSection {
                    endpoint: params.endpoint.clone(),
                }),
                network: Some(ClusterNetworkSection {
                    cni: CniSection { name: "none" },
                    pod_subnets: params.pod_cidr.iter().cloned().collect(),
                }),
                proxy: Some(ProxySection { disabled: true }),
                etcd: params.private_subnet.as_ref().map(|subnet| EtcdSection {
                    advertised_subnets: vec![subnet.clone()],
                }),
            },
            MachineRole::Worker => ClusterSection {
                control_plane: None,
                network: None,
                proxy: None,
                etcd: None,
            },
        };

        let doc = MachineConfigDoc {
            version: "v1alpha1",
            machine: MachineSection {
                machine_type: role.as_config_type(),
                network: NetworkSection {
                    hostname: params.hostname.clone(),
                },
                cert_s_a_ns: match role {
                    MachineRole::ControlPlane => params.sans.clone(),
                    MachineRole::Worker => Vec::new(),
                },
                kubelet,
                node_labels,
            },
            cluster,
        };

        Ok(serde_yaml::to_string(&doc)?.into_bytes())
    }
}
