//! Event publication.
//!
//! Every user-visible outcome pairs with a typed event carrying a stable
//! reason string. Publication failures are logged, never propagated; an
//! unreachable event API must not wedge a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder};
use tracing::warn;

/// Stable event reasons.
pub mod reason {
    pub const RECONCILING: &str = "Reconciling";
    pub const RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";
    pub const PHASE_TIMEOUT: &str = "PhaseTimeout";
    pub const NODE_STUCK: &str = "NodeStuck";
    pub const QUORUM_LOST: &str = "QuorumLost";
    pub const NODE_READY_TIMEOUT: &str = "NodeReadyTimeout";
    pub const CONFIG_APPLY_ERROR: &str = "ConfigApplyError";
    pub const SERVER_CREATION_ERROR: &str = "ServerCreationError";
    pub const NODE_REPLACED: &str = "NodeReplaced";
    pub const SCALING_UP: &str = "ScalingUp";
    pub const SCALING_DOWN: &str = "ScalingDown";
    pub const ADDON_INSTALL_ERROR: &str = "AddonInstallError";
    pub const PROVISIONING_ERROR: &str = "ProvisioningError";
}

/// Sink for cluster-scoped events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn normal(&self, reason: &str, message: &str);
    async fn warning(&self, reason: &str, message: &str);
}

/// [`EventSink`] publishing through the Kubernetes events API.
pub struct KubeEventSink {
    recorder: Recorder,
    reference: ObjectReference,
}

impl KubeEventSink {
    #[must_use]
    pub fn new(recorder: Recorder, reference: ObjectReference) -> Self {
        Self {
            recorder,
            reference,
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, message: &str) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &self.reference).await {
            warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn normal(&self, reason: &str, message: &str) {
        self.publish(EventType::Normal, reason, message).await;
    }

    async fn warning(&self, reason: &str, message: &str) {
        self.publish(EventType::Warning, reason, message).await;
    }
}

/// Sink that drops everything. Used where no recorder is available.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn normal(&self, _reason: &str, _message: &str) {}
    async fn warning(&self, _reason: &str, _message: &str) {}
}
