//! Bare metal Kubernetes bootstrap.
//!
//! Turns a fixed set of already-imaged machines into a working cluster with
//! one of two backends:
//!
//! - **k3s**: the upstream install script is run on every node over SSH.
//! - **Talos**: machine configs are rendered and applied with `talosctl`.
//!
//! Once the API answers, optional add-ons (`MetalLB` and ingress-nginx) are
//! installed with Helm. Every external tool sits behind a narrow trait in
//! [`exec`] so the orchestration logic can be driven by fakes in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use metal_cluster::exec::{CliClientFactory, SshShell};
//! use metal_cluster::{ClusterDefinition, K3sOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ClusterDefinition::K3s(config) = ClusterDefinition::load("demo.yaml".as_ref())? else {
//!         anyhow::bail!("expected a k3s cluster");
//!     };
//!
//!     let orchestrator =
//!         K3sOrchestrator::new(Arc::new(SshShell::new()), Arc::new(CliClientFactory));
//!     let state = orchestrator.create(&config).await?;
//!     println!("{} is {}", state.api_endpoint, state.status);
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod addons;
pub mod config;
pub mod error;
pub mod exec;
pub mod k3s;
pub mod orchestrator;
pub mod state;
pub mod talos;
pub mod wait;

#[cfg(test)]
mod testing;

pub use config::{
    Addons, Backend, ClusterConfig, ClusterDefinition, Credentials, IngressSpec,
    LoadBalancerSpec, NodeConfig, ProvisionerSettings, TalosClusterConfig, TalosNodeConfig,
};
pub use error::{Error, Result};
pub use orchestrator::{K3sOrchestrator, TalosOrchestrator};
pub use state::{
    Checkpoint, ClusterState, ClusterStatus, ComputedState, NoCheckpoint, StateFileCheckpoint,
    StateRecord, TalosClusterState,
};
