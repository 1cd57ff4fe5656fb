use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use minbar_pipeline::{
    create_router, AppState, Config, GeminiProvider, HttpAudioFetcher, MemoryStore, OneSignalSender,
    Orchestrator, RecordStore,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "minbar-pipeline", about = "Sermon transcription and summarization pipeline")]
struct Args {
    /// Config file, without extension
    #[arg(long, default_value = "config/minbar-pipeline")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("{} starting", cfg.service.name);
    info!(
        "HTTP server will bind to {}:{}",
        cfg.service.http.bind, cfg.service.http.port
    );

    let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
    let provider = Arc::new(GeminiProvider::with_model(
        cfg.provider.api_key.clone(),
        cfg.provider.model.clone(),
    ));
    let push = Arc::new(OneSignalSender::new(
        cfg.push.app_id.clone(),
        cfg.push.api_key.clone(),
    ));
    let audio = Arc::new(HttpAudioFetcher::new(cfg.storage.base_url.clone()));

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&store),
        provider,
        push,
        audio,
    ));

    let state = AppState {
        orchestrator,
        store,
        webhook_secret: cfg.billing.webhook_secret.clone(),
    };

    let router = create_router(state);
    let listener =
        tokio::net::TcpListener::bind((cfg.service.http.bind.as_str(), cfg.service.http.port))
            .await
            .context("Failed to bind HTTP listener")?;

    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, router).await?;

    Ok(())
}
