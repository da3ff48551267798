use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mediatree_cluster::tree::{list_templates, template_exists};
use mediatree_cluster::{
    Autoscaler, CleanupJob, HttpInjectionApi, LoadCalculator, NodeSelector, PathBuilder,
    SessionManager, TreeManager,
};
use mediatree_core::config::ProvisionerMode;
use mediatree_core::models::NodeKind;
use mediatree_core::provisioner::{DockerProvisioner, HttpPodApi, KubernetesProvisioner};
use mediatree_core::store::RedisStateStore;
use mediatree_core::{logging, Config, MeshState, Provisioner};

#[derive(Debug, Parser)]
#[command(name = "mediatree", version, about = "Control plane for a live media relay tree")]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "MEDIATREE_CONFIG")]
    config: Option<String>,

    /// Skip creating a tree when the injection pool is empty
    #[arg(long)]
    no_bootstrap: bool,

    /// Build the first tree from this template (overrides mesh.bootstrap_template)
    #[arg(long)]
    template: Option<String>,
}

/// Unique id of this controller replica
fn generate_instance_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

async fn build_provisioner(config: &Config, mesh: &MeshState) -> Result<Arc<dyn Provisioner>> {
    let provisioner: Arc<dyn Provisioner> = match config.provisioner.mode {
        ProvisionerMode::Docker => Arc::new(
            DockerProvisioner::connect(config.provisioner.docker.clone(), mesh.clone())
                .context("Failed to connect to Docker")?,
        ),
        ProvisionerMode::Kubernetes => {
            let api = HttpPodApi::from_config(&config.provisioner.kubernetes)
                .await
                .context("Failed to set up Kubernetes API client")?;
            Arc::new(
                KubernetesProvisioner::new(api, config.provisioner.kubernetes.clone(), mesh.clone())
                    .context("Failed to set up Kubernetes provisioner")?,
            )
        }
    };
    Ok(provisioner)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Configuration
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    let template = cli.template.or_else(|| config.mesh.bootstrap_template.clone());
    if let Some(name) = template.as_deref() {
        if !template_exists(name) {
            let known: Vec<&str> = list_templates().iter().map(|t| t.name).collect();
            return Err(anyhow::anyhow!(
                "Unknown tree template '{name}', expected one of {}",
                known.join(", ")
            ));
        }
    }

    // 2. Logging
    let _log_guard = logging::init_logging(&config.logging)?;
    let instance_id = generate_instance_id();
    info!(instance_id = %instance_id, tree_id = %config.mesh.tree_id, "mediatree starting...");

    // 3. State store
    let store = RedisStateStore::connect(&config.redis)
        .await
        .context("Failed to connect to Redis")?;
    let mesh = MeshState::new(Arc::new(store));
    info!("State store connected");

    // 4. Provisioner and tree
    let provisioner = build_provisioner(&config, &mesh).await?;
    info!(mode = ?config.provisioner.mode, "Provisioner ready");
    let tree = Arc::new(TreeManager::new(
        mesh.clone(),
        provisioner.clone(),
        config.mesh.clone(),
    ));

    if config.mesh.bootstrap_on_start && !cli.no_bootstrap {
        if mesh.pool_members(NodeKind::Injection).await?.is_empty() {
            match template.as_deref() {
                Some(name) => {
                    let created = tree
                        .create_tree(&config.mesh.tree_id, name)
                        .await
                        .context("Failed to create tree from template")?;
                    info!(template = %name, nodes = created.nodes.len(), "Bootstrapped tree from template");
                }
                None => {
                    let nodes = tree.bootstrap().await.context("Failed to bootstrap tree")?;
                    info!(nodes = ?nodes, "Bootstrapped empty tree");
                }
            }
        } else {
            info!("Injection pool already populated, skipping bootstrap");
        }
    }

    // 5. Session services
    let loads = LoadCalculator::new(mesh.clone(), config.load.clone());
    let paths = PathBuilder::new(mesh.clone(), config.session.max_path_hops);
    let selector = Arc::new(NodeSelector::new(mesh.clone(), loads.clone(), paths.clone()));
    let injection_api = Arc::new(HttpInjectionApi::new(config.session.http_timeout())?);
    let sessions = Arc::new(SessionManager::new(
        mesh.clone(),
        selector,
        paths,
        injection_api,
    ));

    // 6. Background jobs
    let cancel_token = CancellationToken::new();
    let cleanup = CleanupJob::new(
        mesh.clone(),
        sessions,
        config.session.clone(),
        cancel_token.clone(),
    );
    let mut tasks = vec![cleanup.start()];
    info!(
        interval_secs = config.session.cleanup_interval_seconds,
        "Session cleanup started"
    );

    if config.autoscaler.enabled {
        let autoscaler = Autoscaler::new(
            mesh.clone(),
            loads,
            tree.clone(),
            config.autoscaler.clone(),
            cancel_token.clone(),
        );
        tasks.push(autoscaler.start());
    } else {
        info!("Autoscaler disabled");
    }

    // 7. Run until interrupted
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received, stopping background jobs...");
    cancel_token.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background job ended abnormally: {}", e);
        }
    }
    if let Err(e) = provisioner.close().await {
        warn!("Failed to close provisioner: {}", e);
    }

    info!(instance_id = %instance_id, "mediatree stopped");
    Ok(())
}
