use std::net::SocketAddr;

use anyhow::Context;
use dotenvy::dotenv;
use tracing::{info, warn};

mod config;
mod error;
mod llm;
mod pipeline;
mod server;
mod session;
mod utils;

use config::CONFIG;
use utils::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging();

    let addr: SocketAddr = CONFIG
        .bind_addr
        .parse()
        .with_context(|| format!("Invalid BIND_ADDR '{}'", CONFIG.bind_addr))?;

    if CONFIG.gemini_api_key.trim().is_empty() {
        warn!("GEMINI_API_KEY is not set; actions will fail until a key is entered in the page.");
    }
    info!(
        "Models: analysis/critique={}, generation={}",
        CONFIG.gemini_model, CONFIG.gemini_image_model
    );

    let session = session::new_shared_session();
    let app = server::build_router(session);

    info!("Starting Remake Studio on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
