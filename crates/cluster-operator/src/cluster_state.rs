//! Cluster-state resolution and ephemeral SSH keys.

use std::future::Future;
use std::sync::Arc;

use base64::Engine as _;
use ed25519_dalek::SigningKey;
use hcloud::CloudProvider;
use rand::rngs::OsRng;
use tracing::{debug, warn};

use crate::crd::{NodeRole, TalosCluster};
use crate::error::{Error, Result};
use crate::naming;

/// Port the generated endpoint URL points at.
const K8S_API_PORT: u16 = 6443;

/// Everything the provisioning pipeline needs to know about the cluster
/// before it can create a server.
#[derive(Debug, Clone, Default)]
pub struct ResolvedClusterState {
    /// Private network ID.
    pub network_id: i64,
    /// Private network CIDR.
    pub network_cidr: String,
    /// Stable API endpoint URL, e.g. `https://1.2.3.4:6443`.
    pub endpoint: String,
    /// Bare IP behind the endpoint.
    pub endpoint_ip: String,
    /// TLS SANs for control plane configs: endpoint, load balancer IP and
    /// every existing control plane's public and private address.
    pub sans: Vec<String>,
    /// IDs of the pre-existing SSH keys from the annotation.
    pub ssh_key_ids: Vec<i64>,
}

/// Name of the cluster's API load balancer.
#[must_use]
pub fn load_balancer_name(cluster: &str) -> String {
    format!("{cluster}-api")
}

/// Resolve the cluster state from spec, status and the provider.
///
/// # Errors
/// Returns an error when the pre-condition network or load balancer is
/// missing, or a provider call fails.
pub async fn resolve(
    cloud: &Arc<dyn CloudProvider>,
    cluster: &TalosCluster,
    cluster_name: &str,
) -> Result<ResolvedClusterState> {
    let network = cloud
        .get_network(&cluster.spec.network.name)
        .await?
        .ok_or_else(|| {
            Error::Config(format!(
                "network {} does not exist",
                cluster.spec.network.name
            ))
        })?;

    let lb_name = load_balancer_name(cluster_name);
    let lb = cloud
        .get_load_balancer(&lb_name)
        .await?
        .ok_or_else(|| Error::Config(format!("load balancer {lb_name} does not exist")))?;

    let lb_ip = lb
        .public_ipv4
        .clone()
        .ok_or_else(|| Error::Config(format!("load balancer {lb_name} has no public IP")))?;

    let endpoint_ip = cluster
        .endpoint_override()
        .map_or_else(|| lb_ip.clone(), ToString::to_string);
    let endpoint = format!("https://{endpoint_ip}:{K8S_API_PORT}");

    let mut sans = vec![endpoint_ip.clone()];
    if !sans.contains(&lb_ip) {
        sans.push(lb_ip);
    }
    if let Some(private) = lb.private_ip {
        if !sans.contains(&private) {
            sans.push(private);
        }
    }
    if let Some(status) = &cluster.status {
        for cp in &status.control_planes.nodes {
            for ip in [&cp.public_ip, &cp.private_ip] {
                if let Some(ip) = ip {
                    if !sans.contains(ip) {
                        sans.push(ip.clone());
                    }
                }
            }
        }
    }

    let mut ssh_key_ids = Vec::new();
    for key_name in cluster.ssh_key_names() {
        match cloud.get_ssh_key_id(&key_name).await? {
            Some(id) => ssh_key_ids.push(id),
            None => {
                warn!(key = %key_name, "Annotated SSH key does not exist, skipping");
            }
        }
    }

    debug!(
        network_id = network.id,
        endpoint = %endpoint,
        sans = ?sans,
        "Cluster state resolved"
    );

    Ok(ResolvedClusterState {
        network_id: network.id,
        network_cidr: network.ip_range,
        endpoint,
        endpoint_ip,
        sans,
        ssh_key_ids,
    })
}

/// Render an OpenSSH `ssh-ed25519` public key line.
fn openssh_public_key(key: &SigningKey, comment: &str) -> String {
    let public = key.verifying_key().to_bytes();

    let mut blob = Vec::with_capacity(4 + 11 + 4 + 32);
    let algo = b"ssh-ed25519";
    blob.extend_from_slice(&u32::try_from(algo.len()).unwrap_or(11).to_be_bytes());
    blob.extend_from_slice(algo);
    blob.extend_from_slice(&u32::try_from(public.len()).unwrap_or(32).to_be_bytes());
    blob.extend_from_slice(&public);

    let encoded = base64::engine::general_purpose::STANDARD.encode(blob);
    format!("ssh-ed25519 {encoded} {comment}")
}

/// Run `f` with a freshly created ephemeral SSH key, deleting the key on
/// every exit path. The key's only purpose is to suppress provider-side
/// password emails; its private half is discarded immediately.
///
/// # Errors
/// Returns the error from key creation or from `f`.
pub async fn with_ephemeral_key<T, F, Fut>(
    cloud: &Arc<dyn CloudProvider>,
    cluster: &str,
    role: NodeRole,
    f: F,
) -> Result<T>
where
    F: FnOnce(i64) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let name = naming::ephemeral_key_name(cluster, role, chrono::Utc::now().timestamp());
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = openssh_public_key(&signing_key, &name);

    let labels = naming::server_labels(cluster, role);
    let key_id = cloud.create_ssh_key(&name, &public_key, &labels).await?;
    debug!(key = %name, id = key_id, "Ephemeral SSH key created");

    let result = f(key_id).await;

    if let Err(e) = cloud.delete_ssh_key(&name).await {
        warn!(key = %name, error = %e, "Failed to delete ephemeral SSH key");
    }

    result
}
