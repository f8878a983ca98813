//! Error types for Talos operations.

use thiserror::Error;

/// Errors that can occur when talking to a Talos node.
#[derive(Error, Debug)]
pub enum TalosError {
    /// Failed to spawn or run the underlying command.
    #[error("I/O error running {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The command ran but exited non-zero.
    #[error("{op} failed for node {node}: {stderr}")]
    CommandFailed {
        op: &'static str,
        node: String,
        stderr: String,
    },

    /// The operation did not complete within its deadline.
    #[error("{op} timed out after {seconds}s waiting on node {node}")]
    Timeout {
        op: &'static str,
        node: String,
        seconds: u64,
    },

    /// Output from the node could not be interpreted.
    #[error("failed to parse {what}: {detail}")]
    Parse { what: &'static str, detail: String },

    /// Machine-config generation failed.
    #[error("config generation failed: {0}")]
    ConfigGeneration(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
