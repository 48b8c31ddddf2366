/*
* Kamino command line
* -------------------
*
* kamino-pod-manager
* ├── serve [--port]                      HTTP API + job worker
* ├── pod
* │   ├── create --template --owner       one pod, inline
* │   ├── delete --name                   tear a pod down (as admin)
* │   └── list [--owner]
* ├── bulk --template --owners a,b,c      one pod per owner
* ├── resources                           per-node usage
* ├── token --user [--admin]              mint a session token
* └── init [--force]                      write config/default.toml
*
* Cluster commands talk to the hypervisor directly with the configured API
* token; nothing goes through a running server.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::api::middleware::rate_limit::GlobalRateLimit;
use crate::api::{create_router, AppState};
use crate::config::Settings;
use crate::core::proxmox::ProxmoxClient;
use crate::jobs::JobQueue;
use crate::lock::{DistributedLock, LockStore, MemoryLockStore, RedisLockStore};
use crate::pods::{PodManager, PodOutcome, PodReport};
use crate::templates::InMemoryTemplateRegistry;
use crate::users::{Identity, TokenAuthority};

#[derive(Parser)]
#[command(name = "kamino-pod-manager")]
#[command(about = "Provisions and tears down Kamino lab pods", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding default.toml / local.toml
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Manage single pods
    Pod {
        #[command(subcommand)]
        command: PodCommands,
    },
    /// Create one pod per owner from the same template
    Bulk {
        #[arg(short, long)]
        template: String,
        #[arg(short, long, value_delimiter = ',')]
        owners: Vec<String>,
    },
    /// Show cluster resource usage
    Resources,
    /// Mint a session token
    Token {
        #[arg(short, long)]
        user: String,
        #[arg(short, long)]
        admin: bool,
    },
    /// Generate default configuration
    Init {
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PodCommands {
    /// Clone a template into a new pod
    Create {
        #[arg(short, long)]
        template: String,
        #[arg(short, long)]
        owner: String,
    },
    /// Delete a pod and all of its VMs
    Delete {
        #[arg(short, long)]
        name: String,
    },
    /// List pods
    List {
        #[arg(short, long)]
        owner: Option<String>,
    },
}

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return handle_init_command(force);
    }

    let settings = match &cli.config {
        Some(path) => Settings::load(&path.to_string_lossy())?,
        None => Settings::new()?,
    };

    match cli.command {
        Commands::Serve { port } => {
            let port = port.unwrap_or(settings.server.port);
            run_server(settings, port).await?;
        }
        Commands::Pod { command } => handle_pod_command(command, settings).await?,
        Commands::Bulk { template, owners } => {
            let manager = build_manager(settings).await?;
            let report = manager.provision_bulk(&template, &owners).await?;
            for pod in &report.pods {
                print_report(pod);
            }
            println!("{} {}", "✓".green(), report.message);
        }
        Commands::Resources => handle_resources_command(settings).await?,
        Commands::Token { user, admin } => {
            let authority = TokenAuthority::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);
            println!("{}", authority.issue(&Identity::new(user, admin))?);
        }
        Commands::Init { .. } => {}
    }

    Ok(())
}

/// Wires the engine from settings. An empty `lock.redis_url` selects the
/// in-process lock store, which only serializes a single replica.
pub async fn build_manager(settings: Settings) -> anyhow::Result<Arc<PodManager>> {
    settings.validate()?;
    let api = Arc::new(ProxmoxClient::new(&settings.proxmox)?);

    let store: Arc<dyn LockStore> = if settings.lock.redis_url.trim().is_empty() {
        warn!("No lock.redis_url configured, using in-process locks");
        Arc::new(MemoryLockStore::new())
    } else {
        Arc::new(
            RedisLockStore::connect(&settings.lock.redis_url)
                .await
                .context("connecting to the lock cache")?,
        )
    };
    let lock = Arc::new(DistributedLock::new(store, settings.lock.policy()));

    Ok(Arc::new(PodManager::new(
        api,
        lock,
        Arc::new(InMemoryTemplateRegistry::new()),
        Arc::new(settings),
    )))
}

pub async fn run_server(settings: Settings, port: u16) -> anyhow::Result<()> {
    settings.validate_for_serving()?;
    let host = settings.server.host.clone();
    let tokens = TokenAuthority::new(&settings.auth.jwt_secret, settings.auth.token_ttl_secs);
    let limits = GlobalRateLimit::from_settings(&settings.rate_limits);

    let manager = build_manager(settings).await?;
    let jobs = JobQueue::start(manager.clone());
    let state = Arc::new(AppState {
        manager,
        jobs: jobs.clone(),
        tokens,
        limits,
    });

    let app = create_router(state);
    let listener = TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {}:{}", host, port))?;
    info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    // In-flight jobs must finish before the runtime goes away.
    jobs.shutdown().await;
    Ok(())
}

async fn handle_pod_command(command: PodCommands, settings: Settings) -> anyhow::Result<()> {
    let manager = build_manager(settings).await?;

    match command {
        PodCommands::Create { template, owner } => {
            info!("Creating pod from {} for {}", template, owner);
            let report = manager.provision_pod(&template, &owner).await?;
            print_report(&report);
            if !report.success {
                bail!("pod {} finished as {:?}", report.pod_name, report.outcome);
            }
        }
        PodCommands::Delete { name } => {
            let report = manager.deprovision_pod(&name, &Identity::admin("cli")).await?;
            print_report(&report);
        }
        PodCommands::List { owner } => {
            println!("{}", "Pods:".bold());
            for pod in manager.list_pods(owner.as_deref()).await? {
                println!("- {} ({} VMs)", pod.name.bold(), pod.vms.len());
                for vm in pod.vms {
                    let status = match vm.status.as_str() {
                        "running" => "running".green(),
                        "stopped" => "stopped".red(),
                        other => other.yellow(),
                    };
                    println!("    {} {} on {} [{}]", vm.vmid, vm.name, vm.node, status);
                }
            }
        }
    }

    Ok(())
}

async fn handle_resources_command(settings: Settings) -> anyhow::Result<()> {
    let manager = build_manager(settings).await?;
    let usage = manager.cluster_usage().await?;

    println!("{}", "Nodes:".bold());
    for node in &usage.nodes {
        println!(
            "- {} cpu {:.1}% mem {}/{} MiB disk {}/{} GiB",
            node.node.bold(),
            node.cpu * 100.0,
            node.memory_used >> 20,
            node.memory_total >> 20,
            node.storage_used >> 30,
            node.storage_total >> 30,
        );
    }
    for failed in &usage.errors {
        println!("- {} {}", failed.node.red(), failed.error);
    }
    println!(
        "{} cpu {:.1}% mem {}/{} MiB disk {}/{} GiB",
        "Cluster:".bold(),
        usage.totals.cpu * 100.0,
        usage.totals.memory_used >> 20,
        usage.totals.memory_total >> 20,
        usage.totals.storage_used >> 30,
        usage.totals.storage_total >> 30,
    );
    Ok(())
}

fn print_report(report: &PodReport) {
    let mark = match report.outcome {
        PodOutcome::Complete => "✓".green(),
        PodOutcome::Partial => "!".yellow(),
        PodOutcome::RolledBack | PodOutcome::Failed => "✗".red(),
    };
    println!("{} {} ({:?})", mark, report.pod_name, report.outcome);
    for error in &report.errors {
        println!("    {}", error.red());
    }
}

fn handle_init_command(force: bool) -> anyhow::Result<()> {
    let config_dir = PathBuf::from("config");
    let target = config_dir.join("default.toml");
    if target.exists() && !force {
        bail!("{} already exists. Use --force to overwrite.", target.display());
    }

    std::fs::create_dir_all(&config_dir)?;
    let default_config = crate::config::generate_default_config();
    let config_str = toml::to_string_pretty(&default_config)?;
    std::fs::write(&target, config_str)?;

    println!("{} Default configuration generated", "✓".green());
    Ok(())
}
