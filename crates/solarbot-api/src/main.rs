//! Solar robot fleet simulator - admin API server and process entry point

use solarbot_core::{ConfigStore, FleetManager};
use solarbot_protocol::UplinkTemplate;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod routes;

use routes::AppState;

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "solarbot_api=debug,solarbot_core=debug,info".into()),
        )
        .init();

    tracing::info!("starting robot fleet simulator");

    // Store open/migrate failure is fatal (exit code 1)
    let db_path = std::env::var("CONFIG_DB").unwrap_or_else(|_| "config.db".to_string());
    let store = Arc::new(ConfigStore::open(Path::new(&db_path))?);

    let settings = store.broker_settings();
    tracing::info!(
        "broker={} qos={} keepalive={}s report_interval={}s",
        settings.broker_url,
        settings.qos,
        settings.keepalive_secs,
        settings.publish_interval_secs
    );

    // Loaded once; shared immutably by every robot
    let template = UplinkTemplate::load(Path::new("uplink_template.json"));

    let fleet = Arc::new(FleetManager::start(Arc::clone(&store), template).await?);
    tracing::info!("fleet started with {} robots", fleet.live_count());

    let state = AppState {
        fleet: Arc::clone(&fleet),
    };
    let app = routes::router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    tracing::info!("admin API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: reconciler, reporters, outbound drain, disconnect
    fleet.shutdown().await;
    tracing::info!("exited cleanly");
    Ok(())
}
