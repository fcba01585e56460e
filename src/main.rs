use std::net::SocketAddr;

use tokio::{net::TcpListener, signal};
use tracing_subscriber::EnvFilter;

use transport_sync::{config::AppConfig, routes, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "server",
        server_host = %config.server_host,
        server_port = config.server_port,
        token_api_url = config.redacted_token_api_url().as_deref().unwrap_or("<static token>"),
        excel_file = %config.sharepoint.excel_file_name,
        strategy = ?config.sync.strategy,
        backup_file = %config.backup_file.display(),
        email_enabled = config.email.enabled,
        admin_enabled = config.admin_token.is_some(),
        "loaded configuration"
    );

    let state = AppState::from_config(config)?;
    let listen_addr: SocketAddr =
        format!("{}:{}", state.config.server_host, state.config.server_port).parse()?;
    let router = routes::create_router(state.clone());

    let scheduler = tokio::spawn(state.scheduler.clone().run());

    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("listening on {}", listen_addr);

    tokio::select! {
        result = axum::serve(listener, router) => result?,
        _ = signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
        }
    }

    scheduler.abort();
    tracing::info!(
        in_flight = state.orchestrator.in_flight(),
        "waiting for background submissions"
    );
    state.orchestrator.wait_idle().await;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
