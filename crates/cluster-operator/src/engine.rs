//! Engine construction and injectable options.

use std::sync::Arc;
use std::time::Duration;

use hcloud::{CloudProvider, HcloudClient};
use prometheus::Registry;
use talos::{ConfigGenerator, MachineConfigBuilder, TalosClient, TalosctlClient};

use crate::addons::{AddonInstaller, HelmInstaller};
use crate::error::{Error, Result};
use crate::metrics::{MeteredCloud, Metrics};
use crate::node_access::NodeAccess;

/// Default cap on per-cycle replacements and scale-ups.
pub const DEFAULT_MAX_CONCURRENT_HEALS: u32 = 3;

/// Default requeue interval when a phase asks to be retried.
pub const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);

/// Bounded waits used by the provisioning pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Waiting for the provider to assign a public IP.
    pub server_ip: Duration,
    /// Waiting for a node to become Ready.
    pub node_ready: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            server_ip: Duration::from_secs(5 * 60),
            node_ready: Duration::from_secs(10 * 60),
        }
    }
}

/// The reconciliation engine: every port it drives plus its tuning.
///
/// Construction goes through [`EngineBuilder`]; tests inject in-memory
/// doubles for each port.
pub struct Engine {
    cloud: Option<Arc<dyn CloudProvider>>,
    pub talos: Arc<dyn TalosClient>,
    pub config_generator: Arc<dyn ConfigGenerator>,
    pub nodes: Arc<dyn NodeAccess>,
    pub addons: Arc<dyn AddonInstaller>,
    pub metrics: Metrics,
    pub max_concurrent_heals: u32,
    pub timeouts: Timeouts,
}

impl Engine {
    /// The cloud client, or [`Error::MissingCredentials`] when neither a
    /// client nor a token was supplied and an operation demands one.
    pub fn cloud(&self) -> Result<&Arc<dyn CloudProvider>> {
        self.cloud.as_ref().ok_or_else(|| {
            Error::MissingCredentials("no hcloud client or token configured".to_string())
        })
    }
}

/// Builder over the engine's injectable collaborators.
pub struct EngineBuilder {
    hcloud_client: Option<Arc<dyn CloudProvider>>,
    hcloud_token: Option<String>,
    talos_client: Option<Arc<dyn TalosClient>>,
    config_generator: Option<Arc<dyn ConfigGenerator>>,
    node_access: Option<Arc<dyn NodeAccess>>,
    addon_installer: Option<Arc<dyn AddonInstaller>>,
    max_concurrent_heals: u32,
    enable_metrics: bool,
    timeouts: Timeouts,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self {
            hcloud_client: None,
            hcloud_token: None,
            talos_client: None,
            config_generator: None,
            node_access: None,
            addon_installer: None,
            max_concurrent_heals: DEFAULT_MAX_CONCURRENT_HEALS,
            enable_metrics: true,
            timeouts: Timeouts::default(),
        }
    }
}

impl EngineBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a cloud client directly.
    #[must_use]
    pub fn with_hcloud_client(mut self, client: Arc<dyn CloudProvider>) -> Self {
        self.hcloud_client = Some(client);
        self
    }

    /// Construct the cloud client from an API token.
    #[must_use]
    pub fn with_hcloud_token(mut self, token: impl Into<String>) -> Self {
        self.hcloud_token = Some(token.into());
        self
    }

    /// Inject the node-OS RPC client.
    #[must_use]
    pub fn with_talos_client(mut self, client: Arc<dyn TalosClient>) -> Self {
        self.talos_client = Some(client);
        self
    }

    /// Inject the machine-config generator.
    #[must_use]
    pub fn with_config_generator(mut self, generator: Arc<dyn ConfigGenerator>) -> Self {
        self.config_generator = Some(generator);
        self
    }

    /// Inject the Kubernetes node surface, including the worker-readiness
    /// waiter.
    #[must_use]
    pub fn with_node_access(mut self, nodes: Arc<dyn NodeAccess>) -> Self {
        self.node_access = Some(nodes);
        self
    }

    /// Inject the addon installer.
    #[must_use]
    pub fn with_addon_installer(mut self, installer: Arc<dyn AddonInstaller>) -> Self {
        self.addon_installer = Some(installer);
        self
    }

    /// Cap per-cycle replacements and scale-ups.
    #[must_use]
    pub fn with_max_concurrent_heals(mut self, n: u32) -> Self {
        self.max_concurrent_heals = n;
        self
    }

    /// Gate all metric recording.
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Override the pipeline waits.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Assemble the engine, registering metrics with the given registry.
    ///
    /// A missing cloud client is not an error here; it becomes
    /// [`Error::MissingCredentials`] the first time an operation needs one.
    ///
    /// # Errors
    /// Returns an error if the node access port is absent, the token is
    /// malformed, or metric registration fails.
    pub fn build(self, registry: &Registry) -> Result<Engine> {
        let metrics = Metrics::new(self.enable_metrics)?.register(registry)?;

        let raw_cloud: Option<Arc<dyn CloudProvider>> = match (self.hcloud_client, self.hcloud_token)
        {
            (Some(client), _) => Some(client),
            (None, Some(token)) => Some(Arc::new(HcloudClient::new(token)?)),
            (None, None) => None,
        };
        let cloud = raw_cloud
            .map(|c| Arc::new(MeteredCloud::new(c, metrics.clone())) as Arc<dyn CloudProvider>);

        let talos_client = self.talos_client.unwrap_or_else(|| {
            let talosconfig = std::env::var("TALOSCONFIG")
                .unwrap_or_else(|_| "/etc/talos/talosconfig".to_string());
            Arc::new(TalosctlClient::new(talosconfig))
        });

        let config_generator = self
            .config_generator
            .unwrap_or_else(|| Arc::new(MachineConfigBuilder));

        let nodes = self
            .node_access
            .ok_or_else(|| Error::Config("node access port is required".to_string()))?;

        let addons = self
            .addon_installer
            .unwrap_or_else(|| Arc::new(HelmInstaller::new()));

        Ok(Engine {
            cloud,
            talos: talos_client,
            config_generator,
            nodes,
            addons,
            metrics,
            max_concurrent_heals: self.max_concurrent_heals,
            timeouts: self.timeouts,
        })
    }
}
