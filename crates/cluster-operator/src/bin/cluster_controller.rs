/*
 * 5D Labs Agent Platform - Talos Cloud Operator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Cluster controller binary: wires the engine to a kube controller and
//! serves health and metrics endpoints.

use std::sync::Arc;

use axum::{routing::get, Router};
use cluster_operator::node_access::KubeNodeAccess;
use cluster_operator::{reconcile, EngineBuilder};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone)]
struct AppState {
    registry: Registry,
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics(state: axum::extract::State<AppState>) -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.registry.gather(), &mut buffer) {
        error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,kube=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting cluster controller");

    let client = kube::Client::try_default().await?;
    let registry = Registry::new();

    let mut builder = EngineBuilder::new()
        .with_node_access(Arc::new(KubeNodeAccess::new(client.clone())))
        .with_metrics(std::env::var("DISABLE_METRICS").is_err());

    match std::env::var("HCLOUD_TOKEN") {
        Ok(token) => builder = builder.with_hcloud_token(token),
        Err(_) => {
            // Operations that need the cloud will surface the missing
            // credential; observation-only use still works.
            info!("HCLOUD_TOKEN not set; cloud operations will fail until provided");
        }
    }

    if let Ok(n) = std::env::var("MAX_CONCURRENT_HEALS") {
        if let Ok(n) = n.parse() {
            builder = builder.with_max_concurrent_heals(n);
        }
    }

    let engine = Arc::new(builder.build(&registry)?);

    let state = AppState {
        registry: registry.clone(),
    };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!("Health and metrics listening on :8080");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Health server failed: {e}");
        }
    });

    reconcile::run(client, engine).await?;

    server.abort();
    info!("Cluster controller shut down");
    Ok(())
}
