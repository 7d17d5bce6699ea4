use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modvault_server::{
    config::Config,
    db::Database,
    services::{cleanup::CleanupService, mail::Mailer},
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modvault_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();

    // Ensure storage directory exists
    std::fs::create_dir_all(&config.storage_path)?;

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;

    let mailer = Mailer::from_config(&config)?;

    let state = AppState {
        db: db.clone(),
        config: config.clone(),
        mailer: mailer.clone(),
    };

    spawn_cleanup_scheduler(db, config.clone(), mailer);

    let app = modvault_server::router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodic maintenance. A run must never overlap another instance of
/// itself; a tick that fires while the previous run is still going is
/// skipped.
fn spawn_cleanup_scheduler(db: Database, config: Config, mailer: Mailer) {
    let interval_secs = config.cleanup_interval_secs;
    let service = CleanupService::new(db.pool, config, mailer);
    let running = Arc::new(tokio::sync::Mutex::new(()));

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match running.try_lock() {
                Ok(_guard) => {
                    tracing::info!("running cleanup pass");
                    service.run_all().await;
                }
                Err(_) => {
                    tracing::warn!("cleanup pass still running, skipping tick");
                }
            }
        }
    });
}
