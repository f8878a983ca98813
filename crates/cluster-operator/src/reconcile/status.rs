//! Status persistence with bounded conflict retry.

use async_trait::async_trait;
use kube::api::PostParams;
use kube::{Api, ResourceExt};
use tracing::{debug, warn};

use crate::crd::{NodePhase, TalosCluster, TalosClusterStatus};
use crate::error::{Error, Result};

/// Attempts before a version conflict is surfaced.
const MAX_CONFLICT_RETRIES: u32 = 5;

/// Port for writing a cluster's status back.
///
/// The engine mutates a working copy in memory; persists happen at explicit
/// points (after server creation, and once at the end of the reconcile).
#[async_trait]
pub trait StatusPersister: Send + Sync {
    async fn persist(&self, cluster: &TalosCluster, status: &TalosClusterStatus) -> Result<()>;
}

/// [`StatusPersister`] writing through the status subresource.
///
/// Retries only on version conflicts, re-reading and re-applying up to
/// [`MAX_CONFLICT_RETRIES`] times; every other error surfaces immediately.
pub struct KubeStatusPersister {
    api: Api<TalosCluster>,
}

impl KubeStatusPersister {
    #[must_use]
    pub fn new(api: Api<TalosCluster>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl StatusPersister for KubeStatusPersister {
    async fn persist(&self, cluster: &TalosCluster, status: &TalosClusterStatus) -> Result<()> {
        let name = cluster.name_any();

        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let mut latest = self.api.get_status(&name).await?;
            latest.status = Some(status.clone());
            latest.managed_fields_mut().clear();

            let body = serde_json::to_vec(&latest)?;
            match self
                .api
                .replace_status(&name, &PostParams::default(), body)
                .await
            {
                Ok(_) => {
                    debug!(cluster = %name, attempt, "Status persisted");
                    return Ok(());
                }
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    warn!(cluster = %name, attempt, "Status update conflicted, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::StatusConflict {
            cluster: name,
            attempts: MAX_CONFLICT_RETRIES,
        })
    }
}

/// Refresh the desired/ready counters of both node groups.
pub fn refresh_group_counters(cluster: &TalosCluster, status: &mut TalosClusterStatus) {
    status.control_planes.desired = cluster.spec.control_planes.count;
    status.workers.desired = cluster.spec.workers.count;

    status.control_planes.ready = count_ready(&status.control_planes.nodes);
    status.workers.ready = count_ready(&status.workers.nodes);
}

fn count_ready(nodes: &[crate::crd::NodeStatus]) -> u32 {
    u32::try_from(
        nodes
            .iter()
            .filter(|n| n.phase == NodePhase::Ready)
            .count(),
    )
    .unwrap_or(u32::MAX)
}
