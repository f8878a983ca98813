//! Addon installation: the CNI first, everything else after.

pub mod helm;

use async_trait::async_trait;

use crate::crd::AddonSpec;
use crate::error::Result;

pub use helm::HelmInstaller;

/// Name of the addon treated as the CNI. It installs during the CNI phase
/// and gates every other addon.
pub const CNI_ADDON: &str = "cilium";

/// Port for installing addons into the workload cluster.
///
/// The engine hands over the kubeconfig it fetched through the node-OS
/// RPC; installers never talk to the management cluster.
#[async_trait]
pub trait AddonInstaller: Send + Sync {
    /// Install or upgrade one addon. Idempotent.
    async fn install(&self, kubeconfig: &[u8], addon: &AddonSpec) -> Result<()>;

    /// Whether the addon's workloads are up.
    async fn is_healthy(&self, kubeconfig: &[u8], addon: &AddonSpec) -> Result<bool>;
}
