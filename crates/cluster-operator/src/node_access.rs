//! Kubernetes node and pod operations the engine depends on.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{DeleteParams, EvictParams, ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// What the engine can see about a Kubernetes Node object.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeView {
    /// The Node object exists.
    pub exists: bool,
    /// The `Ready` condition is `True`.
    pub ready: bool,
    /// The kubelet posted a recent heartbeat (Ready condition present,
    /// whatever its value).
    pub kubelet_reporting: bool,
}

/// Reference to a pod scheduled on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

/// The Kubernetes surface of the engine: node readiness observation,
/// cordon, eviction and deletion.
#[async_trait]
pub trait NodeAccess: Send + Sync {
    /// Observe a node by name.
    async fn get_node(&self, name: &str) -> Result<NodeView>;

    /// Delete a Node object. Absent nodes are not an error.
    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Mark a node unschedulable.
    async fn cordon(&self, name: &str) -> Result<()>;

    /// Pods on the node eligible for eviction: mirror pods and
    /// DaemonSet-owned pods are excluded.
    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>>;

    /// Evict one pod via the eviction API.
    async fn evict_pod(&self, pod: &PodRef) -> Result<()>;

    /// Poll until the node's `Ready` condition is `True`.
    async fn wait_node_ready(&self, name: &str, timeout: Duration) -> Result<()>;
}

/// [`NodeAccess`] over a real cluster connection.
#[derive(Clone)]
pub struct KubeNodeAccess {
    client: Client,
}

/// Poll interval for node readiness.
const NODE_POLL_SECS: u64 = 5;

/// Annotation marking static (mirror) pods.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

impl KubeNodeAccess {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn node_view(node: &Node) -> NodeView {
        let ready_condition = node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"));

        NodeView {
            exists: true,
            ready: ready_condition.is_some_and(|c| c.status == "True"),
            kubelet_reporting: ready_condition.is_some(),
        }
    }
}

#[async_trait]
impl NodeAccess for KubeNodeAccess {
    async fn get_node(&self, name: &str) -> Result<NodeView> {
        match self.nodes().get(name).await {
            Ok(node) => Ok(Self::node_view(&node)),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(NodeView::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        let patch = json!({"spec": {"unschedulable": true}});
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(node = %name, "Node cordoned");
        Ok(())
    }

    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods.list(&lp).await?;

        let mut refs = Vec::new();
        for pod in list.items {
            let meta = &pod.metadata;

            let is_mirror = meta
                .annotations
                .as_ref()
                .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
            if is_mirror {
                continue;
            }

            let is_daemonset = meta
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
            if is_daemonset {
                continue;
            }

            if let (Some(namespace), Some(name)) = (meta.namespace.clone(), meta.name.clone()) {
                refs.push(PodRef { namespace, name });
            }
        }

        Ok(refs)
    }

    async fn evict_pod(&self, pod: &PodRef) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        match pods.evict(&pod.name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => {
                warn!(pod = %pod.name, namespace = %pod.namespace, error = %e, "Eviction failed");
                Err(e.into())
            }
        }
    }

    async fn wait_node_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(NODE_POLL_SECS));

        loop {
            ticker.tick().await;

            let view = self.get_node(name).await.unwrap_or_default();
            if view.ready {
                return Ok(());
            }

            if start.elapsed() > timeout {
                return Err(Error::WaitTimeout {
                    target: format!("node {name} Ready condition"),
                    seconds: timeout.as_secs(),
                });
            }
        }
    }
}
