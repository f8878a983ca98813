//! In-memory doubles for the engine's ports, shared by the scenario tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prometheus::Registry;

use cluster_operator::addons::AddonInstaller;
use cluster_operator::crd::{
    AddonSpec, BootstrapMarker, HealthCheckSpec, NetworkSpec, NodeGroupSpec, NodePhase, NodeRole,
    NodeStatus, TalosCluster, TalosClusterSpec, TalosClusterStatus,
};
use cluster_operator::error::{Error, Result};
use cluster_operator::events::EventSink;
use cluster_operator::node_access::{NodeAccess, NodeView, PodRef};
use cluster_operator::reconcile::status::StatusPersister;
use cluster_operator::{Engine, EngineBuilder};
use hcloud::{
    CloudError, CloudProvider, CreateServerOpts, Image, LoadBalancer, Network, Server, ServerStatus,
};
use talos::{EtcdMember, MachineConfigBuilder, NodeServiceState, TalosClient, TalosError};

/// Cloud double: a map of servers with sequential IDs and a call log.
#[derive(Default)]
pub struct FakeCloud {
    pub servers: Mutex<HashMap<String, Server>>,
    pub networks: Mutex<HashMap<String, Network>>,
    pub load_balancers: Mutex<HashMap<String, LoadBalancer>>,
    pub snapshot: Mutex<Option<Image>>,
    pub ssh_keys: Mutex<HashMap<String, i64>>,
    pub calls: Mutex<Vec<String>>,
    next_id: AtomicI64,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1000),
            ..Self::default()
        })
    }

    /// Seed the standard pre-condition infrastructure and snapshot.
    pub fn seed_infra(&self, cluster: &str) {
        self.networks.lock().unwrap().insert(
            format!("{cluster}-net"),
            Network {
                id: 99,
                name: format!("{cluster}-net"),
                ip_range: "10.0.0.0/16".to_string(),
            },
        );
        self.load_balancers.lock().unwrap().insert(
            format!("{cluster}-api"),
            LoadBalancer {
                id: 12,
                name: format!("{cluster}-api"),
                public_ipv4: Some("203.0.113.10".to_string()),
                private_ip: Some("10.0.0.5".to_string()),
            },
        );
        *self.snapshot.lock().unwrap() = Some(Image {
            id: 55,
            description: "talos-v1.9.0".to_string(),
            labels: BTreeMap::from([("os".to_string(), "talos".to_string())]),
        });
    }

    /// Seed an existing server backing a tracked node.
    pub fn seed_server(
        &self,
        name: &str,
        public_ip: &str,
        private_ip: &str,
        status: ServerStatus,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.servers.lock().unwrap().insert(
            name.to_string(),
            Server {
                id,
                name: name.to_string(),
                status,
                public_ipv4: Some(public_ip.to_string()),
                private_ip: Some(private_ip.to_string()),
                server_type: "cpx31".to_string(),
                labels: BTreeMap::new(),
            },
        );
        id
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| {
                c.starts_with("create_server")
                    || c.starts_with("delete_server")
                    || c.starts_with("create_ssh_key")
                    || c.starts_with("delete_ssh_key")
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn create_server(&self, opts: CreateServerOpts) -> std::result::Result<i64, CloudError> {
        self.log(format!("create_server:{}", opts.name));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let octet = id % 250;
        self.servers.lock().unwrap().insert(
            opts.name.clone(),
            Server {
                id,
                name: opts.name.clone(),
                status: ServerStatus::Running,
                public_ipv4: Some(format!("192.0.2.{octet}")),
                private_ip: Some(format!("10.0.1.{octet}")),
                server_type: opts.server_type,
                labels: opts.labels,
            },
        );
        Ok(id)
    }

    async fn delete_server(&self, name: &str) -> std::result::Result<(), CloudError> {
        self.log(format!("delete_server:{name}"));
        self.servers.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_server_by_name(
        &self,
        name: &str,
    ) -> std::result::Result<Option<Server>, CloudError> {
        Ok(self.servers.lock().unwrap().get(name).cloned())
    }

    async fn get_server_ip(&self, name: &str) -> std::result::Result<String, CloudError> {
        self.servers
            .lock()
            .unwrap()
            .get(name)
            .and_then(|s| s.public_ipv4.clone())
            .ok_or_else(|| CloudError::NotFound(format!("server {name}")))
    }

    async fn get_server_id(&self, name: &str) -> std::result::Result<i64, CloudError> {
        self.servers
            .lock()
            .unwrap()
            .get(name)
            .map(|s| s.id)
            .ok_or_else(|| CloudError::NotFound(format!("server {name}")))
    }

    async fn get_servers_by_label(
        &self,
        _selector: &str,
    ) -> std::result::Result<Vec<Server>, CloudError> {
        Ok(self.servers.lock().unwrap().values().cloned().collect())
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        _public_key: &str,
        _labels: &BTreeMap<String, String>,
    ) -> std::result::Result<i64, CloudError> {
        self.log(format!("create_ssh_key:{name}"));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.ssh_keys.lock().unwrap().insert(name.to_string(), id);
        Ok(id)
    }

    async fn delete_ssh_key(&self, name: &str) -> std::result::Result<(), CloudError> {
        self.log(format!("delete_ssh_key:{name}"));
        self.ssh_keys.lock().unwrap().remove(name);
        Ok(())
    }

    async fn get_ssh_key_id(&self, name: &str) -> std::result::Result<Option<i64>, CloudError> {
        Ok(self.ssh_keys.lock().unwrap().get(name).copied())
    }

    async fn get_network(&self, name: &str) -> std::result::Result<Option<Network>, CloudError> {
        Ok(self.networks.lock().unwrap().get(name).cloned())
    }

    async fn get_snapshot_by_labels(
        &self,
        _selector: &str,
    ) -> std::result::Result<Option<Image>, CloudError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn get_load_balancer(
        &self,
        name: &str,
    ) -> std::result::Result<Option<LoadBalancer>, CloudError> {
        Ok(self.load_balancers.lock().unwrap().get(name).cloned())
    }
}

/// Talos double: config application flips maintenance off; etcd membership
/// is whatever the test seeds.
#[derive(Default)]
pub struct FakeTalos {
    pub applied: Mutex<HashSet<String>>,
    pub members: Mutex<Vec<EtcdMember>>,
    pub removed_members: Mutex<Vec<u64>>,
    pub bootstrapped: Mutex<Vec<String>>,
}

impl FakeTalos {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a node as already configured (an existing cluster member).
    pub fn seed_applied(&self, ip: &str) {
        self.applied.lock().unwrap().insert(ip.to_string());
    }
}

#[async_trait]
impl TalosClient for FakeTalos {
    async fn apply_config(
        &self,
        node_ip: &str,
        _config: &[u8],
    ) -> std::result::Result<(), TalosError> {
        self.applied.lock().unwrap().insert(node_ip.to_string());
        Ok(())
    }

    async fn is_node_in_maintenance_mode(
        &self,
        node_ip: &str,
    ) -> std::result::Result<bool, TalosError> {
        Ok(!self.applied.lock().unwrap().contains(node_ip))
    }

    async fn service_health(
        &self,
        node_ip: &str,
    ) -> std::result::Result<NodeServiceState, TalosError> {
        let configured = self.applied.lock().unwrap().contains(node_ip);
        Ok(NodeServiceState {
            configured,
            kubelet_running: configured,
        })
    }

    async fn get_etcd_members(
        &self,
        _node_ip: &str,
    ) -> std::result::Result<Vec<EtcdMember>, TalosError> {
        Ok(self.members.lock().unwrap().clone())
    }

    async fn remove_etcd_member(
        &self,
        _node_ip: &str,
        member_id: u64,
    ) -> std::result::Result<(), TalosError> {
        self.removed_members.lock().unwrap().push(member_id);
        self.members.lock().unwrap().retain(|m| m.id != member_id);
        Ok(())
    }

    async fn bootstrap(&self, node_ip: &str) -> std::result::Result<(), TalosError> {
        self.bootstrapped.lock().unwrap().push(node_ip.to_string());
        Ok(())
    }

    async fn wait_for_node_ready(
        &self,
        _node_ip: &str,
        _timeout: Duration,
    ) -> std::result::Result<(), TalosError> {
        Ok(())
    }

    async fn kubeconfig(&self, _node_ip: &str) -> std::result::Result<Vec<u8>, TalosError> {
        Ok(b"kubeconfig".to_vec())
    }
}

/// Kubernetes double: nodes are ready by default, with per-name overrides.
pub struct FakeNodes {
    pub default_ready: bool,
    pub overrides: Mutex<HashMap<String, NodeView>>,
    pub deleted: Mutex<Vec<String>>,
    pub cordoned: Mutex<Vec<String>>,
    pub evicted: Mutex<Vec<PodRef>>,
    pub pods: Mutex<HashMap<String, Vec<PodRef>>>,
}

impl FakeNodes {
    pub fn new(default_ready: bool) -> Arc<Self> {
        Arc::new(Self {
            default_ready,
            overrides: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            cordoned: Mutex::new(Vec::new()),
            evicted: Mutex::new(Vec::new()),
            pods: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_view(&self, name: &str, view: NodeView) {
        self.overrides.lock().unwrap().insert(name.to_string(), view);
    }

    fn view(&self, name: &str) -> NodeView {
        self.overrides
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(NodeView {
                exists: self.default_ready,
                ready: self.default_ready,
                kubelet_reporting: self.default_ready,
            })
    }
}

#[async_trait]
impl NodeAccess for FakeNodes {
    async fn get_node(&self, name: &str) -> Result<NodeView> {
        Ok(self.view(name))
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.deleted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn cordon(&self, name: &str) -> Result<()> {
        self.cordoned.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn evictable_pods(&self, node: &str) -> Result<Vec<PodRef>> {
        Ok(self.pods.lock().unwrap().get(node).cloned().unwrap_or_default())
    }

    async fn evict_pod(&self, pod: &PodRef) -> Result<()> {
        self.evicted.lock().unwrap().push(pod.clone());
        Ok(())
    }

    async fn wait_node_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        if self.view(name).ready {
            Ok(())
        } else {
            Err(Error::WaitTimeout {
                target: format!("node {name} Ready condition"),
                seconds: timeout.as_secs(),
            })
        }
    }
}

/// Addon double: installs always succeed and report healthy.
#[derive(Default)]
pub struct FakeAddons {
    pub installed: Mutex<Vec<String>>,
}

impl FakeAddons {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AddonInstaller for FakeAddons {
    async fn install(&self, _kubeconfig: &[u8], addon: &AddonSpec) -> Result<()> {
        self.installed.lock().unwrap().push(addon.name.clone());
        Ok(())
    }

    async fn is_healthy(&self, _kubeconfig: &[u8], _addon: &AddonSpec) -> Result<bool> {
        Ok(true)
    }
}

/// Persister double: counts calls, persists nowhere.
#[derive(Default)]
pub struct MemPersister {
    pub persists: AtomicUsize,
}

impl MemPersister {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StatusPersister for MemPersister {
    async fn persist(&self, _cluster: &TalosCluster, _status: &TalosClusterStatus) -> Result<()> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Event double: records everything.
#[derive(Default)]
pub struct RecordingEvents {
    pub events: Mutex<Vec<(String, String, String)>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn warnings_with_reason(&self, reason: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(kind, r, _)| kind == "Warning" && r == reason)
            .count()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn normal(&self, reason: &str, message: &str) {
        self.events.lock().unwrap().push((
            "Normal".to_string(),
            reason.to_string(),
            message.to_string(),
        ));
    }

    async fn warning(&self, reason: &str, message: &str) {
        self.events.lock().unwrap().push((
            "Warning".to_string(),
            reason.to_string(),
            message.to_string(),
        ));
    }
}

/// Everything a scenario needs in one bundle.
pub struct Harness {
    pub engine: Engine,
    pub cloud: Arc<FakeCloud>,
    pub talos: Arc<FakeTalos>,
    pub nodes: Arc<FakeNodes>,
    pub addons: Arc<FakeAddons>,
    pub events: Arc<RecordingEvents>,
    pub persister: Arc<MemPersister>,
}

impl Harness {
    pub fn new(default_node_ready: bool) -> Self {
        let cloud = FakeCloud::new();
        let talos = FakeTalos::new();
        let nodes = FakeNodes::new(default_node_ready);
        let addons = FakeAddons::new();

        let engine = EngineBuilder::new()
            .with_hcloud_client(cloud.clone())
            .with_talos_client(talos.clone())
            .with_config_generator(Arc::new(MachineConfigBuilder))
            .with_node_access(nodes.clone())
            .with_addon_installer(addons.clone())
            .with_metrics(false)
            .build(&Registry::new())
            .expect("engine builds");

        Self {
            engine,
            cloud,
            talos,
            nodes,
            addons,
            events: RecordingEvents::new(),
            persister: MemPersister::new(),
        }
    }
}

/// Build a cluster spec the scenarios share.
pub fn make_cluster(cp: u32, workers: u32, addons: &[&str], bootstrapped: bool) -> TalosCluster {
    TalosCluster::new(
        "demo",
        TalosClusterSpec {
            control_planes: NodeGroupSpec {
                count: cp,
                server_type: "cpx31".to_string(),
            },
            workers: NodeGroupSpec {
                count: workers,
                server_type: "cpx21".to_string(),
            },
            region: "fsn1".to_string(),
            network: NetworkSpec {
                name: "demo-net".to_string(),
                pod_cidr: None,
            },
            paused: false,
            health_checks: HealthCheckSpec::default(),
            addons: addons
                .iter()
                .map(|name| AddonSpec {
                    name: (*name).to_string(),
                    version: None,
                    values: None,
                })
                .collect(),
            bootstrap: bootstrapped.then_some(BootstrapMarker { completed: true }),
            talos_version: None,
        },
    )
}

/// A tracked node entry in a given phase, wired to a seeded server.
pub fn make_node(
    name: &str,
    role: NodeRole,
    phase: NodePhase,
    public_ip: &str,
    private_ip: &str,
    server_id: i64,
) -> NodeStatus {
    let now = Utc::now();
    let mut node = NodeStatus::new(name, role, now);
    node.phase = phase;
    node.healthy = phase == NodePhase::Ready;
    node.server_id = server_id;
    node.public_ip = Some(public_ip.to_string());
    node.private_ip = Some(private_ip.to_string());
    node.talos_ip = Some(private_ip.to_string());
    if !node.healthy {
        node.unhealthy_since = Some(now);
    }
    node
}
