//! eskeeper-controller: reconciles declared Elasticsearch resources.
//!
//! This daemon:
//! - Loads resource manifests from a directory and polls it for changes
//! - Persists declared resources and their status under a state directory
//! - Runs one controller per resource kind against those stores
//! - Resolves target clusters from the cluster registry and secrets directory
//! - Creates, patches and deletes the remote objects

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use eskeeper_reconcile::TracingRecorder;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eskeeper_controller::config::Args;
use eskeeper_controller::connection::{ClusterRegistry, EsHandleFactory, EsLookup, SecretDir};
use eskeeper_controller::manifest::ManifestSync;
use eskeeper_controller::runtime::{Runtime, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "eskeeper_controller=info,eskeeper_reconcile=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting eskeeper-controller");
    info!("Manifests: {}", args.manifest_dir.display());
    info!("Cluster registry: {}", args.cluster_registry.display());
    info!("State: {}", args.state_dir.display());

    let stores = Stores::open(&args.state_dir).await?;
    let mut manifests = ManifestSync::open(&args.manifest_dir, stores.clone())
        .await
        .context("Failed to restore manifest sources")?;
    let report = manifests
        .sync()
        .await
        .context("Initial manifest sync failed")?;
    info!(
        "Loaded {} resources ({} invalid manifests)",
        report.applied, report.invalid
    );

    let lookup = EsLookup::new(
        Arc::new(ClusterRegistry::from_file(&args.cluster_registry)),
        SecretDir::new(&args.secrets_dir),
    );
    let runtime = Runtime::new(
        stores,
        lookup,
        EsHandleFactory::new(args.request_timeout()),
        Arc::new(TracingRecorder),
        args.controller_config(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let controllers = runtime
        .spawn_controllers(shutdown_rx)
        .await
        .context("Failed to start controllers")?;

    let mut poll = tokio::time::interval(args.poll_interval());
    // The first tick fires immediately and the initial sync already ran
    poll.tick().await;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutting down");
                break;
            }
            _ = poll.tick() => {
                match manifests.sync().await {
                    Ok(report) if report.changed() => info!(
                        "Manifests changed: {} applied, {} deleted, {} invalid",
                        report.applied, report.deleted, report.invalid
                    ),
                    Ok(_) => {}
                    Err(e) => warn!("Manifest sync failed: {:#}", e),
                }
            }
        }
    }

    let _ = shutdown_tx.send(true);
    for controller in controllers {
        if let Err(e) = controller.await {
            error!("Controller task failed: {}", e);
        }
    }

    info!("eskeeper-controller stopped");
    Ok(())
}
