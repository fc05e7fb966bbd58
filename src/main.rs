use anyhow::Result;
use clap::Parser;
use stt_compare::{create_router, AppState, Config};
use tracing::info;

#[derive(Parser)]
#[command(name = "stt-compare", about = "Side-by-side realtime STT comparison server")]
struct Args {
    /// Config file path (TOML), optional
    #[arg(long, default_value = "config/stt-compare")]
    config: String,

    /// Override the bind address from config
    #[arg(long)]
    bind: Option<String>,

    /// Override the port from config
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    let bind = args.bind.unwrap_or_else(|| cfg.service.http.bind.clone());
    let port = args.port.unwrap_or(cfg.service.http.port);
    let addr = format!("{}:{}", bind, port);

    info!("{} starting", cfg.service.name);
    info!("WebSocket endpoint: ws://{}/ws/transcribe", addr);

    let state = AppState::new(cfg);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, router).await?;

    Ok(())
}
