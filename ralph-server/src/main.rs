//! Ralph server - HTTP API, live event streams, and background plan runs.

mod error;
mod routes;
mod sse;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use ralph::events::EventBus;
use ralph::io::registry::Registry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "ralph-server")]
#[command(about = "HTTP and live-event server for ralph plans")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Directory containing UI static files (API-only when absent)
    #[arg(long)]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ralph_server=info".parse()?)
                .add_directive("ralph=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let registry = Registry::open_default()?;
    info!(registry = %registry.path().display(), "starting ralph-server");

    let bus = EventBus::default();
    let state = AppState::new(registry, bus.clone(), AppState::default_engine_factory());
    let roots = state.known_project_roots().unwrap_or_else(|err| {
        warn!(error = %format!("{err:#}"), "cannot read registry, watching nothing yet");
        Vec::new()
    });
    let state = state.with_watcher(sse::start_session_watcher(bus, roots));

    let api_router = routes::api_router();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .nest("/api", api_router)
        .route("/events", get(sse::events_handler))
        .route("/ws", get(sse::ws_handler))
        .layer(cors)
        .with_state(state);

    if let Some(ui_dir) = args.ui_dir {
        if ui_dir.exists() {
            info!(ui_dir = %ui_dir.display(), "serving static UI files");
            app = app.fallback_service(ServeDir::new(ui_dir).append_index_html_on_directories(true));
        } else {
            info!(ui_dir = %ui_dir.display(), "UI directory not found, API-only mode");
        }
    }

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
