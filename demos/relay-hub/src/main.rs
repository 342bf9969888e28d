//! Standalone relay hub.
//!
//! Run with: cargo run -p relay-hub -- --bind 127.0.0.1:8080
//!
//! Endpoints connect to `ws://<bind>/relay`.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use support_tunnel_transport::{LocalRelay, hub::create_hub_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "relay-hub", about = "Topic relay for support tunnel sessions")]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "SUPPORT_TUNNEL_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let app = create_hub_router(LocalRelay::new());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    tracing::info!("Relay hub listening on ws://{}/relay", cli.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
