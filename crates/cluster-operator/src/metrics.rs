//! Prometheus metrics for the reconciliation engine.
//!
//! All recording funnels through [`Metrics`]; when recording is disabled
//! every call is a no-op so callers never need their own gating.

use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounterVec, IntGaugeVec, Registry,
};

use crate::crd::NodeRole;
use crate::error::Result;

#[derive(Clone)]
pub struct Metrics {
    enabled: bool,
    reconcile_total: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    nodes: IntGaugeVec,
    node_replacements_total: IntCounterVec,
    node_replacement_duration_seconds: HistogramVec,
    etcd_members: IntGaugeVec,
    etcd_members_healthy: IntGaugeVec,
    cloud_api_calls_total: IntCounterVec,
    cloud_api_latency_seconds: HistogramVec,
}

impl Metrics {
    /// Create the metric families.
    ///
    /// # Errors
    /// Returns an error if a metric family cannot be constructed.
    pub fn new(enabled: bool) -> Result<Self> {
        Ok(Self {
            enabled,
            reconcile_total: IntCounterVec::new(
                opts!("cluster_reconcile_total", "Reconcile cycles by outcome"),
                &["cluster", "outcome"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            reconcile_duration_seconds: HistogramVec::new(
                histogram_opts!(
                    "cluster_reconcile_duration_seconds",
                    "Reconcile cycle duration"
                ),
                &["cluster", "outcome"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            nodes: IntGaugeVec::new(
                opts!("cluster_nodes", "Node counts by role and kind"),
                &["cluster", "role", "kind"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            node_replacements_total: IntCounterVec::new(
                opts!("cluster_node_replacements_total", "Node replacements"),
                &["cluster", "role", "reason"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            node_replacement_duration_seconds: HistogramVec::new(
                histogram_opts!(
                    "cluster_node_replacement_duration_seconds",
                    "Time from replacement decision to new node provisioned"
                ),
                &["cluster", "role"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            etcd_members: IntGaugeVec::new(
                opts!("cluster_etcd_members", "etcd member count"),
                &["cluster"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            etcd_members_healthy: IntGaugeVec::new(
                opts!("cluster_etcd_members_healthy", "Healthy etcd members"),
                &["cluster"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            cloud_api_calls_total: IntCounterVec::new(
                opts!("cloud_api_calls_total", "Cloud API calls by op and outcome"),
                &["op", "outcome"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
            cloud_api_latency_seconds: HistogramVec::new(
                histogram_opts!("cloud_api_latency_seconds", "Cloud API call latency"),
                &["op"],
            )
            .map_err(|e| anyhow::anyhow!(e))?,
        })
    }

    /// Register every family with a registry.
    ///
    /// # Errors
    /// Returns an error on duplicate registration.
    pub fn register(self, registry: &Registry) -> Result<Self> {
        registry
            .register(Box::new(self.reconcile_total.clone()))
            .and_then(|()| registry.register(Box::new(self.reconcile_duration_seconds.clone())))
            .and_then(|()| registry.register(Box::new(self.nodes.clone())))
            .and_then(|()| registry.register(Box::new(self.node_replacements_total.clone())))
            .and_then(|()| {
                registry.register(Box::new(self.node_replacement_duration_seconds.clone()))
            })
            .and_then(|()| registry.register(Box::new(self.etcd_members.clone())))
            .and_then(|()| registry.register(Box::new(self.etcd_members_healthy.clone())))
            .and_then(|()| registry.register(Box::new(self.cloud_api_calls_total.clone())))
            .and_then(|()| registry.register(Box::new(self.cloud_api_latency_seconds.clone())))
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(self)
    }

    pub fn observe_reconcile(&self, cluster: &str, outcome: &str, seconds: f64) {
        if !self.enabled {
            return;
        }
        self.reconcile_total.with_label_values(&[cluster, outcome]).inc();
        self.reconcile_duration_seconds
            .with_label_values(&[cluster, outcome])
            .observe(seconds);
    }

    pub fn set_node_counts(
        &self,
        cluster: &str,
        role: NodeRole,
        total: i64,
        healthy: i64,
        desired: i64,
    ) {
        if !self.enabled {
            return;
        }
        let role = role.as_str();
        self.nodes.with_label_values(&[cluster, role, "total"]).set(total);
        self.nodes
            .with_label_values(&[cluster, role, "healthy"])
            .set(healthy);
        self.nodes
            .with_label_values(&[cluster, role, "desired"])
            .set(desired);
    }

    pub fn observe_replacement(&self, cluster: &str, role: NodeRole, reason: &str, seconds: f64) {
        if !self.enabled {
            return;
        }
        self.node_replacements_total
            .with_label_values(&[cluster, role.as_str(), reason])
            .inc();
        self.node_replacement_duration_seconds
            .with_label_values(&[cluster, role.as_str()])
            .observe(seconds);
    }

    pub fn set_etcd_members(&self, cluster: &str, total: i64, healthy: i64) {
        if !self.enabled {
            return;
        }
        self.etcd_members.with_label_values(&[cluster]).set(total);
        self.etcd_members_healthy
            .with_label_values(&[cluster])
            .set(healthy);
    }

    pub fn observe_cloud_call(&self, op: &str, outcome: &str, seconds: f64) {
        if !self.enabled {
            return;
        }
        self.cloud_api_calls_total.with_label_values(&[op, outcome]).inc();
        self.cloud_api_latency_seconds
            .with_label_values(&[op])
            .observe(seconds);
    }
}

/// [`hcloud::CloudProvider`] decorator recording per-call count and latency.
pub struct MeteredCloud {
    inner: std::sync::Arc<dyn hcloud::CloudProvider>,
    metrics: Metrics,
}

impl MeteredCloud {
    #[must_use]
    pub fn new(inner: std::sync::Arc<dyn hcloud::CloudProvider>, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }

    async fn observe<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = std::result::Result<T, hcloud::CloudError>>,
    ) -> std::result::Result<T, hcloud::CloudError> {
        let start = std::time::Instant::now();
        let result = fut.await;
        let outcome = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .observe_cloud_call(op, outcome, start.elapsed().as_secs_f64());
        result
    }
}

#[async_trait::async_trait]
impl hcloud::CloudProvider for MeteredCloud {
    async fn create_server(
        &self,
        opts: hcloud::CreateServerOpts,
    ) -> std::result::Result<i64, hcloud::CloudError> {
        self.observe("create_server", self.inner.create_server(opts)).await
    }

    async fn delete_server(&self, name: &str) -> std::result::Result<(), hcloud::CloudError> {
        self.observe("delete_server", self.inner.delete_server(name)).await
    }

    async fn get_server_by_name(
        &self,
        name: &str,
    ) -> std::result::Result<Option<hcloud::Server>, hcloud::CloudError> {
        self.observe("get_server_by_name", self.inner.get_server_by_name(name))
            .await
    }

    async fn get_server_ip(&self, name: &str) -> std::result::Result<String, hcloud::CloudError> {
        self.observe("get_server_ip", self.inner.get_server_ip(name)).await
    }

    async fn get_server_id(&self, name: &str) -> std::result::Result<i64, hcloud::CloudError> {
        self.observe("get_server_id", self.inner.get_server_id(name)).await
    }

    async fn get_servers_by_label(
        &self,
        selector: &str,
    ) -> std::result::Result<Vec<hcloud::Server>, hcloud::CloudError> {
        self.observe(
            "get_servers_by_label",
            self.inner.get_servers_by_label(selector),
        )
        .await
    }

    async fn create_ssh_key(
        &self,
        name: &str,
        public_key: &str,
        labels: &std::collections::BTreeMap<String, String>,
    ) -> std::result::Result<i64, hcloud::CloudError> {
        self.observe(
            "create_ssh_key",
            self.inner.create_ssh_key(name, public_key, labels),
        )
        .await
    }

    async fn delete_ssh_key(&self, name: &str) -> std::result::Result<(), hcloud::CloudError> {
        self.observe("delete_ssh_key", self.inner.delete_ssh_key(name)).await
    }

    async fn get_ssh_key_id(
        &self,
        name: &str,
    ) -> std::result::Result<Option<i64>, hcloud::CloudError> {
        self.observe("get_ssh_key_id", self.inner.get_ssh_key_id(name)).await
    }

    async fn get_network(
        &self,
        name: &str,
    ) -> std::result::Result<Option<hcloud::Network>, hcloud::CloudError> {
        self.observe("get_network", self.inner.get_network(name)).await
    }

    async fn get_snapshot_by_labels(
        &self,
        selector: &str,
    ) -> std::result::Result<Option<hcloud::Image>, hcloud::CloudError> {
        self.observe(
            "get_snapshot_by_labels",
            self.inner.get_snapshot_by_labels(selector),
        )
        .await
    }

    async fn get_load_balancer(
        &self,
        name: &str,
    ) -> std::result::Result<Option<hcloud::LoadBalancer>, hcloud::CloudError> {
        self.observe("get_load_balancer", self.inner.get_load_balancer(name))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_and_gather() {
        let registry = Registry::new();
        let metrics = Metrics::new(true).unwrap().register(&registry).unwrap();

        metrics.observe_reconcile("demo", "success", 0.42);
        metrics.set_node_counts("demo", NodeRole::Worker, 3, 2, 3);
        metrics.observe_cloud_call("create_server", "success", 1.2);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&"cluster_reconcile_total".to_string()));
        assert!(names.contains(&"cluster_nodes".to_string()));
        assert!(names.contains(&"cloud_api_calls_total".to_string()));
    }

    #[test]
    fn test_disabled_metrics_record_nothing() {
        let registry = Registry::new();
        let metrics = Metrics::new(false).unwrap().register(&registry).unwrap();

        metrics.observe_reconcile("demo", "success", 0.42);

        let total: f64 = registry
            .gather()
            .iter()
            .flat_map(|f| f.get_metric().iter().map(|m| m.get_counter().get_value()))
            .sum();
        assert_eq!(total, 0.0);
    }
}
