use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use stopper::Stopper;

use hub_agent::{
    admission::{
        self, haproxy::HaproxyReviewer, hub::HubReviewer, ingress_route::IngressRouteReviewer,
        middleware::KubeMiddlewareStore, nginx::NginxReviewer, policy::KubePolicyGetter,
        traefik::TraefikReviewer, Reviewer,
    },
    config::WebhookConfig,
    filewatcher::FileWatcher,
    ingclass::IngressClasses,
    platform::HttpClient,
    quota::Quotas,
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
    axum_server_handle.graceful_shutdown(Some(std::time::Duration::from_secs(30)));
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

    let config = WebhookConfig::try_from_env().context("failed to read configuration")?;
    let kube_config = kube::Config::infer().await?;
    let client: kube::Client = kube_config.try_into()?;
    let stopper = Stopper::new();

    // Informers
    let classes = IngressClasses::new();
    tokio::spawn(classes.clone().watch(client.clone(), stopper.clone()));
    tokio::spawn(admission::policy_sync::run(
        client.clone(),
        KubeMiddlewareStore::new(client.clone()),
        stopper.clone(),
    ));

    // Reviewers
    let quotas = Quotas::new(config.max_routes);
    let policies = Arc::new(KubePolicyGetter::new(client.clone()));
    let middlewares = Arc::new(KubeMiddlewareStore::new(client.clone()));
    let reviewers: Vec<Arc<dyn Reviewer>> = vec![
        Arc::new(TraefikReviewer::new(
            config.agent_address.clone(),
            classes.clone(),
            policies.clone(),
            middlewares.clone(),
        )),
        Arc::new(IngressRouteReviewer::new(
            config.agent_address.clone(),
            classes.clone(),
            policies.clone(),
            middlewares,
            quotas.clone(),
        )),
        Arc::new(NginxReviewer::new(
            config.agent_address.clone(),
            classes.clone(),
            policies.clone(),
            quotas.clone(),
        )),
        Arc::new(HaproxyReviewer::new(
            config.agent_address.clone(),
            classes,
            policies,
        )),
    ];

    let hub = match config.platform() {
        Some(platform) => Some(HubReviewer::new(Arc::new(HttpClient::new(
            platform.platform_url,
            platform.platform_token,
        )))),
        None => {
            tracing::warn!("platform is not configured, hub resources will be rejected");
            None
        }
    };

    let http_app = admission::create_app(reviewers, quotas, hub);

    // Prepare TLS config for HTTPS serving, reloaded when the certificate changes
    let tls_config = RustlsConfig::from_pem_file(&config.cert_path, &config.key_path).await?;
    let mut watcher = FileWatcher::new(
        {
            let tls_config = tls_config.clone();
            let config = config.clone();
            move || {
                let tls_config = tls_config.clone();
                let config = config.clone();
                async move {
                    match tls_config
                        .reload_from_pem_file(&config.cert_path, &config.key_path)
                        .await
                    {
                        Ok(()) => tracing::info!("TLS certificate reloaded"),
                        Err(error) => tracing::error!(%error, "failed to reload TLS certificate"),
                    }
                }
            }
        },
        10,
        stopper.clone(),
    );
    watcher.watch(config.cert_path.clone());
    watcher.watch(config.key_path.clone());
    watcher.spawn()?;

    // Prepare shutdown signal futures
    let axum_server_handle = axum_server::Handle::new();
    tokio::spawn(shutdown_signal(axum_server_handle.clone(), stopper));

    tracing::info!(listen_addr = %config.listen_addr, "starting webhook server...");
    axum_server::bind_rustls(config.listen_addr.parse()?, tls_config)
        .handle(axum_server_handle)
        .serve(http_app.into_make_service())
        .await?;
    tracing::info!("webhook server terminated");

    Ok(())
}
