//! Error type for the reconciliation engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cloud provider error: {0}")]
    Cloud(#[from] hcloud::CloudError),

    #[error("talos error: {0}")]
    Talos(#[from] talos::TalosError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bounded wait elapsed; the target names what was being waited on.
    #[error("timed out waiting for {target} after {seconds}s")]
    WaitTimeout { target: String, seconds: u64 },

    /// Status update kept conflicting after the bounded retries.
    #[error("status update for {cluster} conflicted {attempts} times")]
    StatusConflict { cluster: String, attempts: u32 },

    /// A required credential was absent when an operation demanded it.
    #[error("missing credentials: {0}")]
    MissingCredentials(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the reconcile should simply requeue rather than warn loudly.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Cloud(e) => e.is_transient(),
            Self::WaitTimeout { .. } => true,
            Self::Kube(kube::Error::Api(resp)) => resp.code >= 500 || resp.code == 409,
            _ => false,
        }
    }
}
