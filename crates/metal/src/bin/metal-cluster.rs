//! metal-cluster CLI - Bootstrap Kubernetes on bare metal nodes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use metal_cluster::exec::{CliClientFactory, SshShell, Talosctl};
use metal_cluster::k3s::{generate_cluster_token, K3sProvisioner};
use metal_cluster::talos::{TalosProvisioner, TalosWorkspace};
use metal_cluster::{
    ClusterDefinition, ComputedState, K3sOrchestrator, StateFileCheckpoint, StateRecord,
    TalosOrchestrator,
};

/// metal-cluster - Bootstrap Kubernetes on bare metal nodes.
#[derive(Parser)]
#[command(name = "metal-cluster")]
#[command(about = "Create, inspect and tear down k3s or Talos clusters on bare metal")]
struct Cli {
    /// Cluster definition file (YAML).
    #[arg(short, long, env = "METAL_CLUSTER_DEFINITION", default_value = "cluster.yaml")]
    definition: PathBuf,

    /// Directory holding per-cluster state files.
    #[arg(long, env = "METAL_CLUSTER_STATE_DIR", default_value = "/tmp/metal-cluster")]
    state_dir: PathBuf,

    /// talosctl binary used for Talos clusters.
    #[arg(long, env = "TALOSCTL", default_value = "talosctl")]
    talosctl: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the definition without contacting any node.
    Validate,

    /// Create the cluster (re-running converges).
    Create,

    /// Refresh and print the cluster status.
    Status,

    /// Apply add-on and artifact changes to an existing cluster.
    Update,

    /// Tear the cluster down.
    Destroy,

    /// Print a freshly generated k3s join token.
    Token,

    /// Print the version running on the first control plane.
    Version,
}

fn load_definition(path: &Path) -> Result<ClusterDefinition> {
    let definition = ClusterDefinition::load(path)
        .with_context(|| format!("Failed to load cluster definition {}", path.display()))?;
    definition
        .validate()
        .with_context(|| format!("Invalid cluster definition {}", path.display()))?;
    Ok(definition)
}

fn load_record(state_dir: &Path, name: &str) -> Result<Option<StateRecord>> {
    StateRecord::load(state_dir, name)
        .with_context(|| format!("Failed to read state for cluster '{name}'"))
}

fn require_record(state_dir: &Path, name: &str) -> Result<StateRecord> {
    load_record(state_dir, name)?.with_context(|| {
        format!("No state for cluster '{name}' in {}; run create first", state_dir.display())
    })
}

fn save(state_dir: &Path, definition: ClusterDefinition, state: ComputedState) -> Result<()> {
    let mut record = StateRecord::new(definition, state);
    let path = record
        .save(state_dir)
        .context("Failed to save cluster state")?;
    info!("State saved to {}", path.display());
    Ok(())
}

fn print_summary(definition: &ClusterDefinition, state: &ComputedState) {
    println!("\n📊 Cluster {}:", definition.name());
    println!("  Backend:  {}", definition.backend());
    println!("  Status:   {}", state.status());
    println!("  API:      {}", state.api_endpoint());
    match state {
        ComputedState::K3s(s) => println!("  Nodes:    {}", s.nodes.join(", ")),
        ComputedState::Talos(s) => {
            println!("  Control:  {}", s.control_plane_ips.join(", "));
            println!("  Workers:  {}", s.worker_ips.join(", "));
        }
    }
}

/// Load the definition for a command that reaches the nodes. Talos
/// clusters need a working talosctl first.
async fn load_cluster(path: &Path, talosctl: &Talosctl) -> Result<ClusterDefinition> {
    let definition = load_definition(path)?;
    if matches!(definition, ClusterDefinition::Talos(_)) {
        let version = talosctl
            .check()
            .await
            .context("talosctl is not usable; install it or pass --talosctl")?;
        info!("Using {}", version.lines().next().unwrap_or_default().trim());
    }
    Ok(definition)
}

/// Cancel `token` on Ctrl-C so waits stop and no further nodes are touched.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step...");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let shell = Arc::new(SshShell::new());
    let talosctl = Arc::new(Talosctl::with_binary(&cli.talosctl));
    let clients = Arc::new(CliClientFactory);
    let k3s =
        K3sOrchestrator::new(shell.clone(), clients.clone()).with_cancellation(cancel.clone());
    let talos =
        TalosOrchestrator::new(talosctl.clone(), clients).with_cancellation(cancel.clone());

    match cli.command {
        Commands::Token => {
            println!("{}", generate_cluster_token());
        }

        Commands::Validate => {
            let definition = load_definition(&cli.definition)?;
            println!(
                "\n✅ {} cluster '{}' is valid",
                definition.backend(),
                definition.name()
            );
        }

        Commands::Create => {
            let definition = load_cluster(&cli.definition, &talosctl).await?;
            let previous = load_record(&cli.state_dir, definition.name())?;
            // Token and secrets land in the state file before any node changes.
            let checkpoint =
                Arc::new(StateFileCheckpoint::new(&cli.state_dir, definition.clone()));

            let state = match (&definition, previous.map(|r| r.state)) {
                (ClusterDefinition::K3s(config), previous) => {
                    let mut config = config.clone();
                    // Keep the join token stable when re-running create.
                    if config.supplied_token().is_none() {
                        if let Some(ComputedState::K3s(prev)) = previous {
                            config.token = Some(prev.token);
                        }
                    }
                    let k3s = k3s.with_checkpoint(checkpoint);
                    ComputedState::K3s(k3s.create(&config).await.context("k3s create failed")?)
                }
                (ClusterDefinition::Talos(config), previous) => {
                    let talos = talos.with_checkpoint(checkpoint);
                    let secrets = match previous {
                        Some(ComputedState::Talos(prev)) => Some(prev.secrets_yaml),
                        _ => None,
                    };
                    ComputedState::Talos(
                        talos
                            .create(config, secrets.as_deref())
                            .await
                            .context("Talos create failed")?,
                    )
                }
            };

            print_summary(&definition, &state);
            save(&cli.state_dir, definition, state)?;
            println!("\n🎉 Cluster created!");
        }

        Commands::Status => {
            let definition = load_cluster(&cli.definition, &talosctl).await?;
            let record = require_record(&cli.state_dir, definition.name())?;

            let refreshed = match (&definition, &record.state) {
                (ClusterDefinition::K3s(config), ComputedState::K3s(prev)) => k3s
                    .read(config, prev)
                    .await?
                    .map(ComputedState::K3s),
                (ClusterDefinition::Talos(config), ComputedState::Talos(prev)) => talos
                    .read(config, prev)
                    .await?
                    .map(ComputedState::Talos),
                _ => bail!("State for '{}' belongs to a different backend", definition.name()),
            };

            if let Some(state) = refreshed {
                print_summary(&definition, &state);
                save(&cli.state_dir, definition, state)?;
            } else {
                println!("\n⚠️  Cluster '{}' no longer exists on its nodes", definition.name());
                StateRecord::remove(&cli.state_dir, definition.name())?;
            }
        }

        Commands::Update => {
            let definition = load_cluster(&cli.definition, &talosctl).await?;
            let record = require_record(&cli.state_dir, definition.name())?;

            let state = match (&definition, &record.definition, &record.state) {
                (
                    ClusterDefinition::K3s(config),
                    ClusterDefinition::K3s(prev_config),
                    ComputedState::K3s(prev),
                ) => ComputedState::K3s(k3s.update(config, prev_config, prev).await?),
                (
                    ClusterDefinition::Talos(config),
                    ClusterDefinition::Talos(prev_config),
                    ComputedState::Talos(prev),
                ) => ComputedState::Talos(talos.update(config, prev_config, prev).await?),
                _ => bail!(
                    "Changing the backend of '{}' requires a new cluster",
                    definition.name()
                ),
            };

            print_summary(&definition, &state);
            save(&cli.state_dir, definition, state)?;
            println!("\n✅ Cluster updated!");
        }

        Commands::Destroy => {
            let definition = load_cluster(&cli.definition, &talosctl).await?;
            match &definition {
                ClusterDefinition::K3s(config) => k3s.delete(config).await?,
                ClusterDefinition::Talos(config) => {
                    let record = require_record(&cli.state_dir, definition.name())?;
                    let ComputedState::Talos(state) = &record.state else {
                        bail!("State for '{}' belongs to a different backend", definition.name());
                    };
                    talos.delete(config, state).await?;
                }
            }
            StateRecord::remove(&cli.state_dir, definition.name())?;
            println!("\n✅ Cluster destroyed: {}", definition.name());
        }

        Commands::Version => {
            let definition = load_cluster(&cli.definition, &talosctl).await?;
            let version = match &definition {
                ClusterDefinition::K3s(config) => {
                    K3sProvisioner::new(shell)
                        .get_version(&config.control_plane)
                        .await?
                }
                ClusterDefinition::Talos(config) => {
                    let record = require_record(&cli.state_dir, definition.name())?;
                    let ComputedState::Talos(state) = &record.state else {
                        bail!("State for '{}' belongs to a different backend", definition.name());
                    };
                    let workspace = TalosWorkspace::with_talosconfig(&state.talos_config)?;
                    TalosProvisioner::new(talosctl)
                        .get_version(&workspace, &config.first_control_plane()?.host)
                        .await?
                }
            };
            println!("{version}");
        }
    }

    Ok(())
}
