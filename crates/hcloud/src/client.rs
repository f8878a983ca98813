//! Hetzner Cloud API client implementation.
//!
//! API documentation: <https://docs.hetzner.cloud/>

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::error::CloudError;
use crate::models::{
    ApiErrorResponse, CreateServerRequest, CreateServerResponse, CreateSshKeyRequest,
    CreateSshKeyResponse, ListImagesResponse, ListLoadBalancersResponse, ListNetworksResponse,
    ListServersResponse, ListSshKeysResponse, PrivateNetRequest, PublicNetRequest, ServerDetails,
};
use crate::provider::{
    CloudProvider, CreateServerOpts, Image, LoadBalancer, Network, Server, ServerStatus,
};

/// Default base URL for the Hetzner Cloud API.
const API_BASE_URL: &str = "https://api.hetzner.cloud/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Hetzner Cloud provider client.
#[derive(Clone)]
pub struct HcloudClient {
    client: Client,
    base_url: String,
    token: String,
}

impl HcloudClient {
    /// Create a new client with the given API token.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created or the token
    /// is empty.
    pub fn new(token: impl Into<String>) -> Result<Self, CloudError> {
        let token = token.into();
        if token.trim().is_empty() {
            return Err(CloudError::Config("hcloud token is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: API_BASE_URL.to_string(),
            token,
        })
    }

    /// Create a client against a non-default endpoint. Used by tests.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_base_url(
        token: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, CloudError> {
        let mut c = Self::new(token)?;
        c.base_url = base_url.into();
        Ok(c)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, CloudError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// DELETE a resource; 404 is treated as success so that deletes stay
    /// idempotent across repeated reconciles.
    async fn delete(&self, path: &str) -> Result<(), CloudError> {
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::error_from(status, response.text().await.unwrap_or_default()))
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse API response");
                CloudError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(CloudError::NotFound(text))
        } else {
            Err(Self::error_from(status, text))
        }
    }

    fn error_from(status: StatusCode, text: String) -> CloudError {
        match serde_json::from_str::<ApiErrorResponse>(&text) {
            Ok(parsed) => CloudError::Api {
                status: status.as_u16(),
                code: parsed.error.code,
                message: parsed.error.message,
            },
            Err(_) => CloudError::Api {
                status: status.as_u16(),
                code: "unknown".to_string(),
                message: text,
            },
        }
    }

    fn to_server(details: &ServerDetails) -> Server {
        let status = match details.status.as_str() {
            "initializing" => ServerStatus::Initializing,
            "starting" => ServerStatus::Starting,
            "running" => ServerStatus::Running,
            "stopping" => ServerStatus::Stopping,
            "off" => ServerStatus::Off,
            "deleting" => ServerStatus::Deleting,
            "migrating" => ServerStatus::Migrating,
            "rebuilding" => ServerStatus::Rebuilding,
            _ => ServerStatus::Unknown,
        };

        Server {
            id: details.id,
            name: details.name.clone(),
            status,
            public_ipv4: details.public_net.ipv4.as_ref().map(|v| v.ip.clone()),
            private_ip: details.private_net.first().map(|n| n.ip.clone()),
            server_type: details.server_type.name.clone(),
            labels: details.labels.clone(),
        }
    }

    async fn find_server(&self, name: &str) -> Result<Option<ServerDetails>, CloudError> {
        let response: ListServersResponse = self.get(&format!("/servers?name={name}")).await?;
        // The API matches by exact name when the `name` filter is used, but
        // guard against fuzzy matches anyway.
        Ok(response.servers.into_iter().find(|s| s.name == name))
    }
}

#[async_trait]
impl CloudProvider for HcloudClient {
    async fn create_server(&self, opts: CreateServerOpts) -> Result<i64, CloudError> {
        info!(
            name = %opts.name,
            server_type = %opts.server_type,
            location = %opts.location,
            "Creating server"
        );

        let private_net = opts.private_ip.as_ref().map(|ip| {
            vec![PrivateNetRequest {
                network: opts.network_id,
                ip: Some(ip.clone()),
            }]
        });

        let req = CreateServerRequest {
            name: opts.name.clone(),
            image: opts.image,
            server_type: opts.server_type,
            location: opts.location,
            ssh_keys: opts.ssh_keys,
            labels: opts.labels,
            user_data: opts.user_data,
            placement_group: opts.placement_group,
            networks: if opts.network_id != 0 {
                vec![opts.network_id]
            } else {
                Vec::new()
            },
            public_net: PublicNetRequest {
                enable_ipv4: opts.enable_public_ipv4,
                enable_ipv6: opts.enable_public_ipv6,
            },
            private_net,
            start_after_create: true,
        };

        let response: CreateServerResponse = self.post("/servers", &req).await?;
        info!(name = %opts.name, id = response.server.id, "Server created");
        Ok(response.server.id)
    }

    async fn delete_server(&self, name: &str) -> Result<(), CloudError> {
        let Some(server) = self.find_server(name).await? else {
            debug!(name = %name, "Server already absent, nothing to delete");
            return Ok(());
        };

        info!(name = %name, id = server.id, "Deleting server");
        self.delete(&format!("/servers/{}", server.id)).await
    }

    async fn get_server_by_name(&self, name: &str) -> Result<Option<Server>, CloudError> {
        Ok(self.find_server(name).await?.as_ref().map(Self::to_server))
    }

    async fn get_server_ip(&self, name: &str) -> Result<String, CloudError> {
        let server = self
            .find_server(name)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("server {name}")))?;

        server
            .public_net
            .ipv4
            .map(|v| v.ip)
            .ok_or_else(|| CloudError::NotFound(format!("public IPv4 for server {name}")))
    }

    async fn get_server_id(&self, name: &str) -> Result<i64, CloudError> {
        let server = self
            .find_server(name)
            .await?
            .ok_or_else(|| CloudError::NotFound(format!("server {name}")))?;

        // The API hands IDs back as JSON numbers, but the engine treats the
        // decimal string form as canonical; a non-numeric form is fatal for
        // the node being provisioned.
        let raw = server.id.to_string();
        raw.parse::<i64>()
            .map_err(|_| CloudError::InvalidResponse(format!("server id '{raw}' is not numeric")))
    }

    async fn get_servers_by_label(&self, selector: &str) -> Result<Vec<Server>, CloudError> {
        let response: ListServersResponse = self
            .get(&format!("/servers?label_selector={selector}"))
            .await?;
        Ok(response.servers.iter().map(Self::to_server).collect())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<i64, CloudError> {
        let req = CreateSshKeyRequest {
            name: name.to_string(),
            public_key: public_key.to_string(),
            labels: labels.clone(),
        };

        let response: CreateSshKeyResponse = self.post("/ssh_keys", &req).await?;
        debug!(name = %name, id = response.ssh_key.id, "SSH key created");
        Ok(response.ssh_key.id)
    }

    async fn delete_ssh_key(&self, name: &str) -> Result<(), CloudError> {
        let response: ListSshKeysResponse = self.get(&format!("/ssh_keys?name={name}")).await?;
        let Some(key) = response.ssh_keys.into_iter().find(|k| k.name == name) else {
            return Ok(());
        };
        self.delete(&format!("/ssh_keys/{}", key.id)).await
    }

    async fn get_ssh_key_id(&self, name: &str) -> Result<Option<i64>, CloudError> {
        let response: ListSshKeysResponse = self.get(&format!("/ssh_keys?name={name}")).await?;
        Ok(response
            .ssh_keys
            .into_iter()
            .find(|k| k.name == name)
            .map(|k| k.id))
    }

    async fn get_network(&self, name: &str) -> Result<Option<Network>, CloudError> {
        let response: ListNetworksResponse = self.get(&format!("/networks?name={name}")).await?;
        Ok(response
            .networks
            .into_iter()
            .find(|n| n.name == name)
            .map(|n| Network {
                id: n.id,
                name: n.name,
                ip_range: n.ip_range,
            }))
    }

    async fn get_snapshot_by_labels(&self, selector: &str) -> Result<Option<Image>, CloudError> {
        let response: ListImagesResponse = self
            .get(&format!("/images?type=snapshot&label_selector={selector}"))
            .await?;
        Ok(response.images.into_iter().next().map(|i| Image {
            id: i.id,
            description: i.description,
            labels: i.labels,
        }))
    }

    async fn get_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>, CloudError> {
        let response: ListLoadBalancersResponse =
            self.get(&format!("/load_balancers?name={name}")).await?;
        Ok(response
            .load_balancers
            .into_iter()
            .find(|lb| lb.name == name)
            .map(|lb| LoadBalancer {
                id: lb.id,
                name: lb.name,
                public_ipv4: lb.public_net.ipv4.map(|v| v.ip),
                private_ip: lb.private_net.first().map(|n| n.ip.clone()),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ipv4Net, PrivateNet, PublicNet, ServerTypeRef};

    fn details(status: &str) -> ServerDetails {
        ServerDetails {
            id: 4711,
            name: "demo-cp-ab1cd".to_string(),
            status: status.to_string(),
            public_net: PublicNet {
                ipv4: Some(Ipv4Net {
                    ip: "1.2.3.4".to_string(),
                }),
            },
            private_net: vec![PrivateNet {
                network: 99,
                ip: "10.0.1.2".to_string(),
            }],
            server_type: ServerTypeRef {
                name: "cpx31".to_string(),
            },
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn test_server_status_mapping() {
        assert_eq!(
            HcloudClient::to_server(&details("running")).status,
            ServerStatus::Running
        );
        assert_eq!(
            HcloudClient::to_server(&details("starting")).status,
            ServerStatus::Starting
        );
        assert_eq!(
            HcloudClient::to_server(&details("weird-new-status")).status,
            ServerStatus::Unknown
        );
    }

    #[test]
    fn test_to_server_addresses() {
        let server = HcloudClient::to_server(&details("running"));
        assert_eq!(server.public_ipv4.as_deref(), Some("1.2.3.4"));
        assert_eq!(server.private_ip.as_deref(), Some("10.0.1.2"));
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            HcloudClient::new("  "),
            Err(CloudError::Config(_))
        ));
    }
}
