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

//! Kubernetes operator driving Talos clusters on Hetzner Cloud from a
//! declarative `TalosCluster` resource: phased provisioning, per-node
//! lifecycle, continuous verification, stuck-node recovery and
//! quorum-safe healing.

pub mod addons;
pub mod cluster_state;
pub mod crd;
pub mod engine;
pub mod error;
pub mod events;
pub mod metrics;
pub mod naming;
pub mod node_access;
pub mod reconcile;

pub use crd::{TalosCluster, TalosClusterSpec, TalosClusterStatus};
pub use engine::{Engine, EngineBuilder};
pub use error::{Error, Result};
