use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use stopper::Stopper;
use tokio::sync::broadcast::Sender;

use hub_agent::{
    config::ControllerConfig,
    leader_election::Lease,
    platform::HttpClient,
    reconcile::{self, ReconcilerContext},
    types::FIELD_MANAGER,
};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(shutdown_signal_broadcast_tx: Sender<()>, stopper: Stopper) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("terminate signal received");

    let _ = shutdown_signal_broadcast_tx.send(());
    stopper.stop();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = ControllerConfig::try_from_env().context("failed to read configuration")?;
    let kube_config = kube::Config::infer().await?;
    let default_namespace = kube_config.default_namespace.clone();
    let client: kube::Client = kube_config.try_into()?;

    // Prepare shutdown signal futures
    let stopper = Stopper::new();
    let (shutdown_signal_broadcast_tx, mut shutdown_signal_broadcast_rx) =
        tokio::sync::broadcast::channel::<()>(1);
    tokio::spawn(shutdown_signal(shutdown_signal_broadcast_tx, stopper.clone()));

    // Leader election
    tracing::info!("attempting to acquire leader lease...");
    let hostname = hostname::get()?;
    let hostname = hostname.to_string_lossy();
    let lease_fut = Lease::acquire_or_create(
        client.clone(),
        &default_namespace,
        FIELD_MANAGER,
        &hostname,
    );
    let lease = tokio::select! {
        lease = lease_fut => lease?,
        _ = shutdown_signal_broadcast_rx.recv() => {
            // Early exit when shutdown signal is received
            return Ok(());
        }
    };
    tracing::info!("acquired lease");

    let interval = Duration::from_secs(config.sync_interval_secs.max(1));
    let ctx = Arc::new(ReconcilerContext {
        client,
        platform: Arc::new(HttpClient::new(
            config.platform_url.clone(),
            config.platform_token.clone(),
        )),
        config,
    });

    tracing::info!("spawning reconcilers...");
    let acp_handle = tokio::spawn({
        let ctx = ctx.clone();
        let stopper = stopper.clone();
        async move {
            reconcile::run_periodically("access-control-policy", interval, stopper, || {
                let ctx = ctx.clone();
                async move { reconcile::acp::reconcile(&ctx).await }
            })
            .await
        }
    });
    let edge_ingress_handle = tokio::spawn(async move {
        reconcile::run_periodically("edge-ingress", interval, stopper, || {
            let ctx = ctx.clone();
            async move { reconcile::edge_ingress::reconcile(&ctx).await }
        })
        .await
    });

    // Await all spawned futures
    let res = tokio::try_join!(acp_handle, edge_ingress_handle);
    tracing::info!("reconcilers terminated");

    tracing::info!("releasing lease...");
    lease.join().await?;
    tracing::info!("lease released");

    res?;

    Ok(())
}
