//! Talos Linux integration for the cluster operator.
//!
//! Two abstractions live here:
//!
//! * [`TalosClient`]: the node-OS RPC surface the reconciliation engine
//!   needs: apply machine config, query machine state, manage etcd
//!   membership, fetch a kubeconfig. The default implementation,
//!   [`TalosctlClient`], drives the `talosctl` binary.
//! * [`ConfigGenerator`]: role-specific machine-config generation. The
//!   default implementation, [`MachineConfigBuilder`], renders Talos
//!   machine-config YAML tuned for Cilium (no default CNI, kube-proxy
//!   disabled) on a private Hetzner network.

pub mod client;
pub mod config;
pub mod error;

pub use client::{EtcdMember, NodeServiceState, TalosClient, TalosctlClient};
pub use config::{ConfigGenerator, MachineConfigBuilder, MachineRole, NodeConfigParams};
pub use error::TalosError;

/// Port the Talos API (apid) listens on.
pub const TALOS_API_PORT: u16 = 50000;

/// Port the Kubernetes API server listens on.
pub const K8S_API_PORT: u16 = 6443;
