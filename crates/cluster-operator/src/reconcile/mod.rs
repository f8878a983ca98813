//! Reconciler wiring: the kube controller loop around the engine.

pub mod drain;
pub mod heal;
pub mod nodes;
pub mod phases;
pub mod provision;
pub mod status;
pub mod verify;
pub mod watchdog;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Recorder, Reporter};
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, error, info, warn};

use crate::crd::{ProvisioningPhase, TalosCluster};
use crate::engine::{Engine, DEFAULT_REQUEUE};
use crate::error::{Error, Result};
use crate::events::{reason, EventSink, KubeEventSink};
use crate::reconcile::status::{KubeStatusPersister, StatusPersister};

/// Shared context handed to every reconcile.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub engine: Arc<Engine>,
    pub reporter: Reporter,
}

/// One reconcile of one cluster.
///
/// The runtime serializes reconciles per cluster key; status is mutated on
/// a working copy and persisted before return (plus the explicit
/// intermediate persists inside the pipeline).
pub async fn reconcile(cluster: Arc<TalosCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start = std::time::Instant::now();
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    debug!(cluster = %name, namespace = %namespace, "Reconciling");

    let api: Api<TalosCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let persister = KubeStatusPersister::new(api);
    let recorder = Recorder::new(ctx.client.clone(), ctx.reporter.clone());
    let events = KubeEventSink::new(recorder, cluster.object_ref(&()));

    if cluster.spec.paused {
        info!(cluster = %name, "Cluster paused, skipping");
        return Ok(Action::requeue(DEFAULT_REQUEUE));
    }

    let mut status = cluster.status.clone().unwrap_or_default();
    status.observed_generation = cluster.metadata.generation;
    status.last_reconcile_time = Some(Utc::now());

    if status.provisioning_phase != ProvisioningPhase::Complete {
        events
            .normal(
                reason::RECONCILING,
                &format!("reconciling phase {}", status.provisioning_phase),
            )
            .await;
    }

    let result = ctx
        .engine
        .orchestrate(&cluster, &name, &mut status, &events, &persister)
        .await;

    match result {
        Ok(action) => {
            persister.persist(&cluster, &status).await?;
            if status.provisioning_phase != ProvisioningPhase::Complete {
                events
                    .normal(
                        reason::RECONCILE_SUCCEEDED,
                        &format!("now in phase {}", status.provisioning_phase),
                    )
                    .await;
            }
            ctx.engine
                .metrics
                .observe_reconcile(&name, "success", start.elapsed().as_secs_f64());
            Ok(action)
        }
        Err(e) => {
            status.push_last_error(e.to_string());
            if let Err(persist_err) = persister.persist(&cluster, &status).await {
                warn!(cluster = %name, error = %persist_err, "Persisting status after error failed");
            }
            ctx.engine
                .metrics
                .observe_reconcile(&name, "error", start.elapsed().as_secs_f64());
            Err(e)
        }
    }
}

/// Requeue on errors; transient ones come back quicker.
#[must_use]
pub fn error_policy(cluster: Arc<TalosCluster>, err: &Error, _ctx: Arc<Context>) -> Action {
    warn!(cluster = %cluster.name_any(), error = %err, "Reconcile failed");
    if err.is_transient() {
        Action::requeue(std::time::Duration::from_secs(10))
    } else {
        Action::requeue(DEFAULT_REQUEUE)
    }
}

/// Run the controller until shutdown.
///
/// # Errors
/// Returns an error if the CRD is not installed.
pub async fn run(client: Client, engine: Arc<Engine>) -> Result<()> {
    let clusters: Api<TalosCluster> = Api::all(client.clone());

    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("TalosCluster CRD is not queryable: {e}. Is the CRD installed?");
        return Err(e.into());
    }

    let context = Arc::new(Context {
        client,
        engine,
        reporter: Reporter {
            controller: "cluster-operator".into(),
            instance: std::env::var("HOSTNAME").ok(),
        },
    });

    info!("Starting TalosCluster controller");

    Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => debug!(cluster = %object.name, "Reconciliation successful"),
                Err(e) => error!(error = %e, "Reconciliation error"),
            }
        })
        .await;

    info!("TalosCluster controller shut down");
    Ok(())
}
