use std::sync::Arc;

use room_server::config::Config;
use room_server::services::access::PgDirectory;
use room_server::services::sweeper::spawn_ticket_sweeper;
use room_server::state::AppState;
use room_server::{db, routes};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;

    let directory = Arc::new(PgDirectory::new(pool));
    let _sweeper = spawn_ticket_sweeper(directory.clone(), config.ticket_sweep_interval);

    let port = config.port;
    let state = AppState::new(directory, config);
    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "room server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;
    Ok(())
}
