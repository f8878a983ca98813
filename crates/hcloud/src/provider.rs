//! Provider trait and domain types for the cloud layer.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudError;

/// Server status as reported by the cloud provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    /// Server is being created.
    Initializing,
    /// Server is booting.
    Starting,
    /// Server is up.
    Running,
    /// Server is shutting down.
    Stopping,
    /// Server is powered off.
    Off,
    /// Server is being deleted.
    Deleting,
    /// Server is being migrated.
    Migrating,
    /// Server is being rebuilt.
    Rebuilding,
    /// Unknown status.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Off => write!(f, "off"),
            Self::Deleting => write!(f, "deleting"),
            Self::Migrating => write!(f, "migrating"),
            Self::Rebuilding => write!(f, "rebuilding"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A provisioned server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Provider-assigned numeric identifier.
    pub id: i64,
    /// Server name (unique per project).
    pub name: String,
    /// Current status.
    pub status: ServerStatus,
    /// Public IPv4 address, if assigned.
    pub public_ipv4: Option<String>,
    /// IP on the attached private network, if any.
    pub private_ip: Option<String>,
    /// Server type name (e.g. "cpx31").
    pub server_type: String,
    /// Labels attached to the server.
    pub labels: BTreeMap<String, String>,
}

/// A private network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub id: i64,
    pub name: String,
    /// Network CIDR (e.g. "10.0.0.0/16").
    pub ip_range: String,
}

/// An OS image (snapshot).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub description: String,
    pub labels: BTreeMap<String, String>,
}

/// A load balancer fronting the cluster API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: i64,
    pub name: String,
    /// Public IPv4 of the load balancer.
    pub public_ipv4: Option<String>,
    /// IP on the attached private network, if any.
    pub private_ip: Option<String>,
}

/// Request to create a new server.
#[derive(Debug, Clone, Default)]
pub struct CreateServerOpts {
    /// Server name; must be unique within the project.
    pub name: String,
    /// Image ID to boot from (a Talos snapshot).
    pub image: i64,
    /// Server type name (already normalized via the size mapping).
    pub server_type: String,
    /// Location name (e.g. "fsn1").
    pub location: String,
    /// SSH key IDs to attach.
    pub ssh_keys: Vec<i64>,
    /// Labels to attach.
    pub labels: BTreeMap<String, String>,
    /// Cloud-init user data, if any.
    pub user_data: Option<String>,
    /// Placement group ID, if any.
    pub placement_group: Option<i64>,
    /// Private network to attach.
    pub network_id: i64,
    /// Requested private IP within the network, if pinned.
    pub private_ip: Option<String>,
    /// Whether to allocate a public IPv4.
    pub enable_public_ipv4: bool,
    /// Whether to allocate a public IPv6.
    pub enable_public_ipv6: bool,
}

/// Trait for the cloud provider operations the engine depends on.
///
/// Implementations are stateless from the engine's point of view; every
/// method is safe to call from concurrent reconciles of different clusters.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Create a new server and return its ID.
    async fn create_server(&self, opts: CreateServerOpts) -> Result<i64, CloudError>;

    /// Delete a server by name. Deleting an absent server is not an error.
    async fn delete_server(&self, name: &str) -> Result<(), CloudError>;

    /// Look up a server by name.
    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, CloudError>;

    /// Get the public IPv4 of a server by name.
    ///
    /// Returns [`CloudError::NotFound`] if the server does not exist or has
    /// no public address yet.
    async fn get_server_ip(&self, name: &str) -> Result<String, CloudError>;

    /// Get the canonical numeric ID of a server by name.
    async fn get_server_id(&self, name: &str) -> Result<i64, CloudError>;

    /// List servers matching a label selector (e.g. `cluster=my-cluster`).
    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<Server>, CloudError>;

    /// Upload an SSH public key and return its ID.
    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64, CloudError>;

    /// Delete an SSH key by name. Deleting an absent key is not an error.
    async fn delete_ssh_key(&self, name: &str) -> Result<(), CloudError>;

    /// Look up an SSH key ID by name.
    async fn get_ssh_key_id(&self, name: &str) -> Result<Option<i64>, CloudError>;

    /// Look up a private network by name.
    async fn get_network(&self, name: &str) -> Result<Option<Network>, CloudError>;

    /// Find a snapshot image by label selector (e.g. `os=talos`).
    async fn get_snapshot_by_labels(&self, selector: &str) -> Result<Option<Image>, CloudError>;

    /// Look up a load balancer by name.
    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>, CloudError>;
}
