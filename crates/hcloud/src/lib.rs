//! Hetzner Cloud API client for the Talos cluster operator.
//!
//! This crate provides the [`CloudProvider`] abstraction the reconciliation
//! engine programs against, plus [`HcloudClient`], the HTTP implementation
//! backed by the Hetzner Cloud v1 API.
//!
//! # Example
//!
//! ```rust,ignore
//! use hcloud::{CloudProvider, HcloudClient};
//!
//! let cloud = HcloudClient::new(std::env::var("HCLOUD_TOKEN")?)?;
//! let server = cloud.get_server_by_name("my-cluster-cp-abc12").await?;
//! ```

pub mod client;
pub mod error;
pub mod models;
pub mod provider;

pub use client::HcloudClient;
pub use error::CloudError;
pub use provider::{
    CloudProvider, CreateServerOpts, Image, LoadBalancer, Network, Server, ServerStatus,
};
