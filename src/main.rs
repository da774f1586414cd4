//! Cluster Discovery - Main Entry Point
//!
//! Joins the configured cluster, runs discovery rounds and serves the admin API.

use actix_web::{web, App, HttpServer};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cluster_discovery::api::{configure_health_routes, AppState};
use cluster_discovery::config::Settings;
use cluster_discovery::discovery::{create_backend, DiscoveryCoordinator};
use cluster_discovery::metrics::{init_metrics, metrics_endpoint};
use cluster_discovery::models::PresenceRecord;
use cluster_discovery::presence::LocalPresence;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with RUST_LOG environment variable support
    // Default: info level for cluster_discovery, warn for everything else
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,cluster_discovery=info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true))
        .init();

    // Load configuration; a bad configuration aborts startup
    let settings = Settings::load()?;
    settings.validate()?;

    let cluster = settings.node.cluster_name.clone();
    info!(
        "Starting Cluster Discovery v{} ({})",
        env!("CARGO_PKG_VERSION"),
        settings.node.node_id
    );
    info!("Cluster: {}", cluster);
    info!("Backend: {:?}", settings.discovery.backend);

    init_metrics();

    let presence = LocalPresence::new(
        PresenceRecord::new(&settings.node.node_id, settings.node.logical_name())
            .with_address(settings.node.advertise_address()),
    );

    let shutdown = CancellationToken::new();
    let backend = create_backend(&settings, presence, &shutdown).await?;
    let coordinator = DiscoveryCoordinator::new(backend);
    coordinator.start(&cluster).await?;

    let app_state = AppState::new(&settings.node.node_id, &cluster, coordinator.backend().name());
    app_state.set_ready(true);

    // Admin server
    let admin = if settings.admin.enabled {
        let admin_addr = format!("{}:{}", settings.admin.host, settings.admin.port);
        info!("Starting admin server on {}", admin_addr);

        let state = app_state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .wrap(TracingLogger::default())
                .configure(configure_health_routes)
                .service(metrics_endpoint)
        })
        .workers(1)
        .disable_signals()
        .bind(&admin_addr)?
        .run();

        let handle = server.handle();
        actix_web::rt::spawn(async move {
            if let Err(e) = server.await {
                error!("Admin server error: {}", e);
            }
        });
        Some(handle)
    } else {
        None
    };

    // Discovery rounds until interrupted
    let round_interval = Duration::from_secs(settings.discovery.round_interval_sec.max(1));
    let rounds = {
        let coordinator = coordinator.clone();
        let cluster = cluster.clone();
        let shutdown = shutdown.clone();
        actix_web::rt::spawn(async move {
            let mut interval = tokio::time::interval(round_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let members = coordinator.fetch_cluster_members(&cluster).await;
                let listed: Vec<String> = members.iter().map(|m| m.to_string()).collect();
                info!(cluster = %cluster, count = listed.len(), members = ?listed, "Cluster members");
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    app_state.set_ready(false);
    shutdown.cancel();
    if let Err(e) = rounds.await {
        if !e.is_cancelled() {
            error!("Discovery round loop ended abnormally: {}", e);
        }
    }
    coordinator.stop().await;

    if let Some(handle) = admin {
        handle.stop(true).await;
    }

    Ok(())
}
