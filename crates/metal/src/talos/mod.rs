//! Talos Linux cluster provisioning.
//!
//! Talos nodes have no shell; everything goes through `talosctl`, run in a
//! private [`TalosWorkspace`] that holds the secrets and generated configs.

mod bootstrap;
mod config;
pub mod parse;

pub use bootstrap::{TalosProvisioner, TALOS_API_PORT};
pub use config::{
    node_patch, patch_file_name, Role, TalosWorkspace, CONTROLPLANE_FILE, KUBECONFIG_FILE,
    SECRETS_FILE, TALOSCONFIG_FILE, WORKER_FILE,
};
