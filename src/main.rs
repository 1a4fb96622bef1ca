use std::sync::Arc;

use snafu::{ensure, ResultExt as _};
use tokio::net::TcpListener;

use viewtrends::api::{create_router, App};
use viewtrends::cache::ResultCache;
use viewtrends::config::Config;
use viewtrends::database::Database;
use viewtrends::error::*;
use viewtrends::ingest::{Pipeline, Scheduler};
use viewtrends::logger;
use viewtrends::predict::{ModelRegistry, PredictionService};
use viewtrends::source::{Adapter, YouTubeApi};

#[tokio::main]
async fn main() -> Result<(), ApplicationError> {
    let config = Config::load()?;

    let _guard = logger::init(&config.server)?;

    ensure!(!config.youtube.api_keys.is_empty(), MissingApiKeysSnafu);

    let database = Database::connect(&config.surreal)
        .await
        .context(ConnectDatabaseSnafu)?;
    let cache = Arc::new(ResultCache::new(*config.predict.cache_ttl));

    let adapter = Adapter::new(
        YouTubeApi::new(&config.youtube),
        config.youtube.api_keys.clone(),
        Arc::new(config.youtube.ledger()),
        config.youtube.retry_policy(),
    );
    let pipeline = Arc::new(Pipeline::new(
        Arc::new(adapter),
        database.clone(),
        cache.clone(),
        config.ingest.clone(),
    ));

    let models = ModelRegistry::load(&config.predict.model_dir).context(LoadModelsSnafu)?;
    let predictions = PredictionService::new(database, cache.clone(), models, config.predict.features());

    let scheduler = Scheduler::spawn(pipeline.clone(), cache);

    let app = App::new(Arc::new(predictions)).with_monitor(pipeline);
    let address = config.server.host_address;
    let listener = TcpListener::bind(address)
        .await
        .context(BindAddressSnafu { address })?;

    tracing::info!(%address, "serving forecasts");

    axum::serve(listener, create_router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(WebServerSnafu)?;

    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
