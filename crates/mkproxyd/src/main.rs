//! mkproxyd: the mkproxy daemon.
//!
//! Serves read access to PipelineRuns that MultiKueue has dispatched to
//! worker clusters:
//! - Job resolution against the hub's Kueue Workloads
//! - Worker kubeconfig cache fed by MultiKueueCluster changes
//! - REST API and websocket log streaming
//!
//! # Usage
//!
//! ```text
//! mkproxyd --port 8080 --workers-secret-namespace kueue-system
//! ```

mod settings;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mkproxy_api::{build_router, ProxyState};
use mkproxy_kube::{HubApi, KubeAccessReviewer, KubeConnector, KubeHub};
use mkproxy_registry::{ClusterConfigRegistry, ConfigLoader, RegistryWatcher};
use mkproxy_resolver::JobResolver;

use crate::settings::{Cli, LogFormat, Settings};

const DEFAULT_LOG_FILTER: &str = "info,mkproxy=debug,mkproxyd=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    init_tracing(settings.log_format);
    run(settings).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn hub_config(settings: &Settings) -> anyhow::Result<Config> {
    match &settings.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("loading hub kubeconfig")
        }
        None => Config::infer().await.context("inferring hub cluster config"),
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    info!(
        port = settings.port,
        secret_namespace = %settings.secret_namespace,
        request_timeout_ms = settings.request_timeout.as_millis() as u64,
        "mkproxyd starting"
    );

    // ── Hub clients ────────────────────────────────────────────

    let config = hub_config(&settings).await?;
    info!(hub = %config.cluster_url, "hub config loaded");
    let client = Client::try_from(config.clone()).context("building hub client")?;
    let hub: Arc<dyn HubApi> = Arc::new(KubeHub::new(client));

    // ── Worker registry ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let registry = Arc::new(ClusterConfigRegistry::new());
    let loader = ConfigLoader::new(hub.clone(), &settings.secret_namespace)
        .with_secret_key(&settings.secret_key);
    let watcher = RegistryWatcher::new(loader, registry.clone()).spawn(shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let state = ProxyState::new(
        JobResolver::new(hub).with_owner_kind(&settings.owner_kind),
        registry,
        Arc::new(KubeAccessReviewer::new(config)),
        Arc::new(KubeConnector),
        settings.proxy_config(),
    );
    let router = build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving API")?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = watcher.await {
        warn!(error = %e, "registry watcher task failed");
    }

    info!("mkproxyd stopped");
    Ok(())
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
