mod protocol;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use cct_core::{ServerConfig, SessionManager, Storage, SubprocessSdkClient};

use crate::state::AppState;

/// Control terminal server: brokers browser WebSocket clients to local agent
/// subprocess sessions.
#[derive(Parser, Debug)]
#[command(name = "cct-server")]
struct Cli {
    /// Address to bind the WebSocket listener to.
    #[arg(long, env = "CCT_BIND_ADDR", default_value = "127.0.0.1:8787")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(ServerConfig::load()?);

    let storage = Storage::open(&config.db_path).await?;

    let agent_command = config.agent_command.clone();
    let sdk_factory: cct_core::session::SdkClientFactory = Arc::new(move || {
        Box::new(SubprocessSdkClient::new(agent_command.clone())) as Box<dyn cct_core::AgentSdkClient>
    });

    let manager = Arc::new(SessionManager::new(storage, config.clone(), sdk_factory));

    if config.cleanup_enabled {
        cct_core::cleanup::spawn(manager.clone(), config.cleanup_interval_hours, config.session_retention_days);
    }

    let state = AppState::new(manager, config.clone());

    let app = Router::new()
        .route("/agent/ws", get(ws::agent_ws))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!(addr = %cli.bind, "cct-server listening");
    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
