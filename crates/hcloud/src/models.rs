//! Wire types for the Hetzner Cloud v1 API.
//!
//! Only the fields the operator reads are modeled; everything else in the
//! API responses is ignored by serde.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Error envelope returned by the API on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: String,
    pub message: String,
}

/// `POST /servers` request body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateServerRequest {
    pub name: String,
    pub image: i64,
    pub server_type: String,
    pub location: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<i64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placement_group: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<i64>,
    pub public_net: PublicNetRequest,
    /// Requested private IP within the first attached network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_net: Option<Vec<PrivateNetRequest>>,
    pub start_after_create: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicNetRequest {
    pub enable_ipv4: bool,
    pub enable_ipv6: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrivateNetRequest {
    pub network: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// `POST /servers` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServerResponse {
    pub server: ServerDetails,
}

/// `GET /servers/{id}` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct GetServerResponse {
    pub server: ServerDetails,
}

/// `GET /servers` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ListServersResponse {
    pub servers: Vec<ServerDetails>,
}

/// Server object as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerDetails {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub public_net: PublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
    pub server_type: ServerTypeRef,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicNet {
    pub ipv4: Option<Ipv4Net>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ipv4Net {
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrivateNet {
    pub network: i64,
    pub ip: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerTypeRef {
    pub name: String,
}

/// `POST /ssh_keys` request body.
#[derive(Debug, Clone, Serialize)]
pub struct CreateSshKeyRequest {
    pub name: String,
    pub public_key: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSshKeyResponse {
    pub ssh_key: SshKeyDetails,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListSshKeysResponse {
    pub ssh_keys: Vec<SshKeyDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshKeyDetails {
    pub id: i64,
    pub name: String,
}

/// `GET /networks` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ListNetworksResponse {
    pub networks: Vec<NetworkDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkDetails {
    pub id: i64,
    pub name: String,
    pub ip_range: String,
}

/// `GET /images` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ListImagesResponse {
    pub images: Vec<ImageDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageDetails {
    pub id: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// `GET /load_balancers` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct ListLoadBalancersResponse {
    pub load_balancers: Vec<LoadBalancerDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerDetails {
    pub id: i64,
    pub name: String,
    pub public_net: LbPublicNet,
    #[serde(default)]
    pub private_net: Vec<PrivateNet>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LbPublicNet {
    pub ipv4: Option<Ipv4Net>,
}
