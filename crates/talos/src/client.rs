//! Talos API client driving the `talosctl` binary.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TalosError;

/// One member of the embedded etcd cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    /// Member ID.
    pub id: u64,
    /// Member name (usually the node hostname).
    pub name: String,
    /// Peer endpoint host (the node's private IP).
    pub endpoint: String,
    /// Whether this member currently leads the cluster.
    pub is_leader: bool,
}

/// Service-level state of a configured node.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeServiceState {
    /// The node has accepted a machine config (secure API answers).
    pub configured: bool,
    /// The kubelet service is up.
    pub kubelet_running: bool,
}

/// The node-OS RPC surface the reconciliation engine depends on.
#[async_trait]
pub trait TalosClient: Send + Sync {
    /// Apply a machine configuration to a node in maintenance mode.
    async fn apply_config(&self, node_ip: &str, config: &[u8]) -> Result<(), TalosError>;

    /// Whether the node is up but still unconfigured (maintenance mode).
    async fn is_node_in_maintenance_mode(&self, node_ip: &str) -> Result<bool, TalosError>;

    /// Service state of a configured node (best effort, short timeouts).
    async fn service_health(&self, node_ip: &str) -> Result<NodeServiceState, TalosError>;

    /// List etcd members as seen from the given node.
    async fn get_etcd_members(&self, node_ip: &str) -> Result<Vec<EtcdMember>, TalosError>;

    /// Remove an etcd member by ID, via the given node.
    async fn remove_etcd_member(&self, node_ip: &str, member_id: u64) -> Result<(), TalosError>;

    /// Bootstrap etcd on the first control plane. Tolerates a node that is
    /// already bootstrapped.
    async fn bootstrap(&self, node_ip: &str) -> Result<(), TalosError>;

    /// Wait until the node reports healthy, up to the given timeout.
    async fn wait_for_node_ready(&self, node_ip: &str, timeout: Duration) -> Result<(), TalosError>;

    /// Fetch an admin kubeconfig via the given control plane.
    async fn kubeconfig(&self, node_ip: &str) -> Result<Vec<u8>, TalosError>;
}

/// [`TalosClient`] implementation that shells out to `talosctl`.
#[derive(Debug, Clone)]
pub struct TalosctlClient {
    /// Path to the cluster talosconfig with client credentials.
    talosconfig: PathBuf,
    /// Per-command deadline.
    command_timeout: Duration,
}

/// Poll interval for readiness loops.
const READY_POLL_SECS: u64 = 10;

/// Default per-command deadline.
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 60;

impl TalosctlClient {
    /// Create a client that authenticates with the given talosconfig.
    #[must_use]
    pub fn new(talosconfig: impl Into<PathBuf>) -> Self {
        Self {
            talosconfig: talosconfig.into(),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
        }
    }

    /// Override the per-command deadline.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run talosctl against a node with the cluster credentials.
    async fn run(
        &self,
        op: &'static str,
        node_ip: &str,
        args: &[&str],
    ) -> Result<String, TalosError> {
        let mut cmd = Command::new("talosctl");
        cmd.arg("--talosconfig")
            .arg(&self.talosconfig)
            .args(["--nodes", node_ip, "--endpoints", node_ip])
            .args(args)
            .kill_on_drop(true);

        self.run_command(op, node_ip, cmd).await
    }

    /// Run talosctl without credentials, for maintenance-mode nodes.
    async fn run_insecure(
        &self,
        op: &'static str,
        node_ip: &str,
        args: &[&str],
    ) -> Result<String, TalosError> {
        let mut cmd = Command::new("talosctl");
        cmd.args(["--nodes", node_ip])
            .args(args)
            .arg("--insecure")
            .kill_on_drop(true);

        self.run_command(op, node_ip, cmd).await
    }

    async fn run_command(
        &self,
        op: &'static str,
        node_ip: &str,
        mut cmd: Command,
    ) -> Result<String, TalosError> {
        debug!(op, node = %node_ip, "Running talosctl");

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| TalosError::Timeout {
                op,
                node: node_ip.to_string(),
                seconds: self.command_timeout.as_secs(),
            })?
            .map_err(|source| TalosError::Io { op, source })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(TalosError::CommandFailed {
                op,
                node: node_ip.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// COSI resource document shape emitted by `talosctl get -o json`.
#[derive(Debug, Deserialize)]
struct ResourceDoc {
    #[serde(default)]
    spec: serde_json::Value,
}

/// Parse the NDJSON stream from `talosctl get etcdmembers -o json`.
fn parse_etcd_members(raw: &str) -> Result<Vec<EtcdMember>, TalosError> {
    let mut members = Vec::new();

    for doc in serde_json::Deserializer::from_str(raw).into_iter::<ResourceDoc>() {
        let doc = doc.map_err(|e| TalosError::Parse {
            what: "etcd members",
            detail: e.to_string(),
        })?;

        let spec = &doc.spec;
        let member_id = spec
            .get("memberId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TalosError::Parse {
                what: "etcd members",
                detail: "missing memberId".to_string(),
            })?;
        // Member IDs come as hex strings.
        let id = u64::from_str_radix(member_id.trim_start_matches("0x"), 16).map_err(|e| {
            TalosError::Parse {
                what: "etcd members",
                detail: format!("memberId '{member_id}': {e}"),
            }
        })?;

        let name = spec
            .get("hostname")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let endpoint = spec
            .get("peerUrls")
            .and_then(|v| v.as_array())
            .and_then(|urls| urls.first())
            .and_then(|v| v.as_str())
            .map(peer_url_host)
            .unwrap_or_default();

        members.push(EtcdMember {
            id,
            name,
            endpoint,
            // Leadership is not part of the member resource; callers that
            // need it must consult etcd status separately.
            is_leader: false,
        });
    }

    Ok(members)
}

/// Extract the host from a peer URL like `https://10.0.1.2:2380`.
fn peer_url_host(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    stripped
        .rsplit_once(':')
        .map_or(stripped, |(host, _port)| host)
        .to_string()
}

#[async_trait]
impl TalosClient for TalosctlClient {
    async fn apply_config(&self, node_ip: &str, config: &[u8]) -> Result<(), TalosError> {
        // talosctl only takes a file path; stage the config in a temp file
        // and remove it on every exit path.
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("machineconfig-{node_ip}-{nanos}.yaml"));
        tokio::fs::write(&path, config)
            .await
            .map_err(|source| TalosError::Io {
                op: "apply-config",
                source,
            })?;

        let result = self
            .run_insecure(
                "apply-config",
                node_ip,
                &["apply-config", "--file", &path.to_string_lossy()],
            )
            .await;

        let _ = tokio::fs::remove_file(&path).await;

        result.map(|_| {
            info!(node = %node_ip, "Machine config applied");
        })
    }

    async fn is_node_in_maintenance_mode(&self, node_ip: &str) -> Result<bool, TalosError> {
        // A maintenance-mode node answers the insecure API; a configured
        // node rejects it.
        match self
            .run_insecure("version", node_ip, &["version", "--short"])
            .await
        {
            Ok(_) => Ok(true),
            Err(TalosError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn service_health(&self, node_ip: &str) -> Result<NodeServiceState, TalosError> {
        // The secure API answering at all means a config has been accepted.
        let services = match self.run("services", node_ip, &["services"]).await {
            Ok(out) => out,
            Err(TalosError::CommandFailed { .. } | TalosError::Timeout { .. }) => {
                return Ok(NodeServiceState::default());
            }
            Err(e) => return Err(e),
        };

        let kubelet_running = services
            .lines()
            .any(|line| line.contains("kubelet") && line.contains("Running"));

        Ok(NodeServiceState {
            configured: true,
            kubelet_running,
        })
    }

    async fn get_etcd_members(&self, node_ip: &str) -> Result<Vec<EtcdMember>, TalosError> {
        let raw = self
            .run(
                "etcd-members",
                node_ip,
                &["get", "etcdmembers", "-o", "json"],
            )
            .await?;
        parse_etcd_members(&raw)
    }

    async fn remove_etcd_member(&self, node_ip: &str, member_id: u64) -> Result<(), TalosError> {
        let id = format!("{member_id:x}");
        info!(node = %node_ip, member = %id, "Removing etcd member");
        self.run(
            "etcd-remove-member",
            node_ip,
            &["etcd", "remove-member", &id],
        )
        .await
        .map(|_| ())
    }

    async fn bootstrap(&self, node_ip: &str) -> Result<(), TalosError> {
        match self.run("bootstrap", node_ip, &["bootstrap"]).await {
            Ok(_) => {
                info!(node = %node_ip, "etcd bootstrap issued");
                Ok(())
            }
            Err(TalosError::CommandFailed { stderr, .. })
                if stderr.contains("AlreadyExists") || stderr.contains("already") =>
            {
                debug!(node = %node_ip, "etcd already bootstrapped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_node_ready(
        &self,
        node_ip: &str,
        timeout: Duration,
    ) -> Result<(), TalosError> {
        let start = tokio::time::Instant::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(READY_POLL_SECS));

        loop {
            ticker.tick().await;

            match self
                .run(
                    "health",
                    node_ip,
                    &["health", "--server=false", "--wait-timeout", "30s"],
                )
                .await
            {
                Ok(_) => {
                    info!(node = %node_ip, "Node reports healthy");
                    return Ok(());
                }
                Err(e) => {
                    debug!(node = %node_ip, error = %e, "Node not healthy yet");
                }
            }

            if start.elapsed() > timeout {
                warn!(node = %node_ip, "Timed out waiting for node health");
                return Err(TalosError::Timeout {
                    op: "wait-for-node-ready",
                    node: node_ip.to_string(),
                    seconds: timeout.as_secs(),
                });
            }
        }
    }

    async fn kubeconfig(&self, node_ip: &str) -> Result<Vec<u8>, TalosError> {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("kubeconfig-{node_ip}-{nanos}"));

        let result = self
            .run(
                "kubeconfig",
                node_ip,
                &["kubeconfig", "--force", &path.to_string_lossy()],
            )
            .await;

        match result {
            Ok(_) => {
                let bytes = tokio::fs::read(&path)
                    .await
                    .map_err(|source| TalosError::Io {
                        op: "kubeconfig",
                        source,
                    })?;
                let _ = tokio::fs::remove_file(&path).await;
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&path).await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_etcd_members() {
        let raw = r#"{"node": "10.0.1.2", "metadata": {"id": "1"}, "spec": {"memberId": "aabbccdd00112233", "hostname": "demo-cp-ab1cd", "peerUrls": ["https://10.0.1.2:2380"], "isLearner": false}}
{"node": "10.0.1.2", "metadata": {"id": "2"}, "spec": {"memberId": "0011223344556677", "hostname": "demo-cp-xy9zw", "peerUrls": ["https://10.0.1.3:2380"], "isLearner": false}}"#;

        let members = parse_etcd_members(raw).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, 0xaabb_ccdd_0011_2233);
        assert_eq!(members[0].name, "demo-cp-ab1cd");
        assert_eq!(members[0].endpoint, "10.0.1.2");
        assert_eq!(members[1].endpoint, "10.0.1.3");
    }

    #[test]
    fn test_parse_etcd_members_rejects_garbage_id() {
        let raw = r#"{"spec": {"memberId": "not-hex", "hostname": "x", "peerUrls": []}}"#;
        assert!(parse_etcd_members(raw).is_err());
    }

    #[test]
    fn test_peer_url_host() {
        assert_eq!(peer_url_host("https://10.0.1.2:2380"), "10.0.1.2");
        assert_eq!(peer_url_host("http://10.0.1.2:2380"), "10.0.1.2");
        assert_eq!(peer_url_host("10.0.1.2"), "10.0.1.2");
    }

    #[test]
    fn test_empty_member_list() {
        assert!(parse_etcd_members("").unwrap().is_empty());
    }
}
