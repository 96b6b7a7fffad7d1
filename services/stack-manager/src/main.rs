//! stackd
//!
//! Provisions short-lived per-user, per-problem workloads on a cluster,
//! exposes each on a node port, and reclaims them on delete, expiry, or drift.

use std::sync::Arc;

use anyhow::{Context, Result};
use stackd_manager::{
    api,
    cleanup::CleanupReconciler,
    config::{redact_secret, Config, GatewayKind, KubernetesSettings},
    db::{Database, MemoryStackStore, StackStore},
    gateway::{ClusterGateway, KubernetesConfig, KubernetesGateway, MockGateway, TimeoutGateway},
    scheduler::SchedulerWorker,
    stack::StackService,
    state::AppState,
};
use stackd_networking::PortAllocator;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to STACKD_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stackd");
    config.log_summary();

    let store = build_store(&config).await?;
    let gateway = build_gateway(&config)?;
    let ports = Arc::new(PortAllocator::new(config.node_port_range()?));

    let service = Arc::new(StackService::new(
        store,
        gateway,
        ports,
        config.admission_limits(),
        config.service_config(),
    ));
    service
        .recover_ports()
        .await
        .context("failed to recover node port allocations")?;

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(CleanupReconciler::new(
        service.clone(),
        config.reconciler_config(),
    ));
    let scheduler = SchedulerWorker::new(reconciler, config.cleanup_interval)?;
    let scheduler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            scheduler.run(shutdown_rx).await;
        }
    });

    let app = api::create_router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                // A dropped sender also means shutdown.
                let _ = shutdown_rx.wait_for(|stopping| *stopping).await;
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if tokio::time::timeout(config.shutdown_timeout, scheduler_handle)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.shutdown_timeout.as_secs(),
            "Cleanup scheduler did not shut down in time"
        );
    }

    info!("stackd shutdown complete");
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn StackStore>> {
    let Some(db_config) = &config.database else {
        warn!("DATABASE_URL not set; using in-memory stack store");
        return Ok(Arc::new(MemoryStackStore::new()));
    };

    let db = Database::connect(db_config).await.map_err(|e| {
        error!(error = %e, "Failed to connect to database");
        e
    })?;

    if config.run_migrations {
        db.run_migrations().await.map_err(|e| {
            error!(error = %e, "Failed to run migrations");
            e
        })?;
    }

    Ok(Arc::new(db.stack_store()))
}

fn build_gateway(config: &Config) -> Result<Arc<dyn ClusterGateway>> {
    let inner: Arc<dyn ClusterGateway> = match &config.gateway {
        GatewayKind::Mock => {
            warn!("Using in-memory mock cluster gateway");
            Arc::new(MockGateway::new())
        }
        GatewayKind::Kubernetes(settings) => Arc::new(kubernetes_gateway(settings)?),
    };

    Ok(Arc::new(TimeoutGateway::new(inner, config.gateway_timeout)))
}

fn kubernetes_gateway(settings: &KubernetesSettings) -> Result<KubernetesGateway> {
    let token = match std::fs::read_to_string(&settings.token_file) {
        Ok(token) => {
            let token = token.trim().to_string();
            info!(token = %redact_secret(&token), "Loaded service account token");
            Some(token)
        }
        Err(e) => {
            warn!(path = %settings.token_file.display(), error = %e, "No service account token; calling the API unauthenticated");
            None
        }
    };
    let ca_pem = match std::fs::read(&settings.ca_file) {
        Ok(pem) => Some(pem),
        Err(e) => {
            warn!(path = %settings.ca_file.display(), error = %e, "No cluster CA bundle; using system roots");
            None
        }
    };

    info!(api_url = %settings.api_url, namespace = %settings.namespace, "Using Kubernetes cluster gateway");
    KubernetesGateway::new(KubernetesConfig {
        api_url: settings.api_url.clone(),
        namespace: settings.namespace.clone(),
        token,
        ca_pem,
    })
    .context("failed to build Kubernetes client")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
