mod bridge;
mod config;
mod error;
mod gemini;
mod handlers;
mod mapper;
mod middleware;
mod patch;

use anyhow::Result;
use config::Config;
use gemini::GeminiClient;
use handlers::AppState;
use patch::PatchPolicy;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(config.log_level.to_lowercase()))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Gemini API key loaded (...{})", config.api_key_hint());

    let backend = Arc::new(GeminiClient::new(&config)?);
    let patch_policy = PatchPolicy::with_extra_phrases(&config.patch_markers);
    let app = handlers::router(AppState::new(backend, patch_policy));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
