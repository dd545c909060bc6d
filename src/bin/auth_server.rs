use anyhow::{Context, Result};
use axum::{routing, Router};
use stopper::Stopper;
use tower_http::trace::TraceLayer;

use hub_agent::{
    acp::{keys::RemoteKeySets, switcher::HandlerSwitcher, watcher},
    config::AuthServerConfig,
};

/// Generate future that awaits shutdown signal
async fn shutdown_signal(axum_server_handle: axum_server::Handle, stopper: Stopper) {
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

    stopper.stop();
    axum_server_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
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

    let config = AuthServerConfig::try_from_env().context("failed to read configuration")?;
    let kube_config = kube::Config::infer().await?;
    let client: kube::Client = kube_config.try_into()?;
    let stopper = Stopper::new();

    // Policies are served by the router currently installed in the switcher
    let switcher = HandlerSwitcher::default();
    let (policy_watcher, rebuilder) = watcher::new(switcher.clone(), RemoteKeySets::default());
    tokio::spawn(policy_watcher.watch(client, stopper.clone()));
    tokio::spawn(rebuilder.run(stopper.clone()));

    let http_app = Router::new()
        .route("/ping", routing::get(|| async { "ok" }))
        .fallback_service(switcher.into_router())
        .layer(TraceLayer::new_for_http());

    let axum_server_handle = axum_server::Handle::new();
    tokio::spawn(shutdown_signal(axum_server_handle.clone(), stopper));

    tracing::info!(listen_addr = %config.listen_addr, "starting auth server...");
    axum_server::bind(config.listen_addr.parse()?)
        .handle(axum_server_handle)
        .serve(http_app.into_make_service())
        .await?;
    tracing::info!("auth server terminated");

    Ok(())
}
