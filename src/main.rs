use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;
use tracing::info;

use tryon_pipeline::{
    TryOnService,
    config::Config,
    db::Database,
    generation::GenerationClient,
    http,
    ledger::UsageLedger,
    provider::GeminiProvider,
    storage::LocalFileStorage,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()?;
    let api_key = config
        .gemini_api_key
        .clone()
        .context("missing GEMINI_API_KEY")?;

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("create storage dir {}", config.storage_dir.display()))?;
    if let Some(parent) = config
        .database_url
        .strip_prefix("sqlite://")
        .and_then(|rest| rest.split('?').next())
        .and_then(|path| std::path::Path::new(path).parent())
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create database dir {}", parent.display()))?;
    }

    let db = Database::connect(&config.database_url).await?;
    let storage = Arc::new(LocalFileStorage::new(
        config.storage_dir.clone(),
        config.public_base_url.clone(),
    ));
    let provider = GeminiProvider::new(
        api_key,
        config.gemini_base_url.clone(),
        config.gemini_model.clone(),
        config.provider_timeout,
    )?;
    let http_client = Client::builder()
        .timeout(config.provider_timeout)
        .build()
        .context("build http client")?;
    let generator = GenerationClient::new(Arc::new(provider), http_client.clone(), config.retry);
    let ledger = UsageLedger::new(db.clone(), config.plan_defaults);
    let service = Arc::new(TryOnService::new(
        db,
        ledger,
        storage,
        generator,
        http_client,
        config.normalize,
    ));

    let router = http::router(service, &config.route_prefix());
    let bind_address = config.bind_address();
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(address = %bind_address, model = %config.gemini_model, "try-on server started");

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
