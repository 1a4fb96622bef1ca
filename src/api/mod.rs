//! JSON API exposing forecasts.

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use snafu::ResultExt as _;
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::ingest::IngestStats;
use crate::model::{PredictionResult, SizeClass, VideoId};
use crate::predict::PredictionStats;
use crate::source::AdapterStats;

pub use error::*;
pub use state::App;

mod error;
mod state;

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

pub fn create_router(app: App) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/videos/:video/prediction", get(prediction))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

/// `video` is a bare id or a percent-encoded watch URL.
#[instrument(skip(app))]
async fn prediction(
    State(app): State<App>, Path(video): Path<String>,
) -> Result<Json<PredictionResult>> {
    let video_id: VideoId = video.parse().context(InvalidVideoIdSnafu)?;
    let result = app
        .predictions
        .predict(&video_id)
        .await
        .context(PredictionSnafu)?;

    Ok(Json(result))
}

#[derive(Debug, Serialize)]
struct ModelInfo {
    size_class: SizeClass,
    version: String,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    models: Vec<ModelInfo>,
    predictions: PredictionStats,
    ingest: Option<IngestStats>,
    source: Option<AdapterStats>,
}

async fn health(State(app): State<App>) -> Json<Health> {
    let models: Vec<ModelInfo> = app
        .predictions
        .models()
        .versions()
        .into_iter()
        .map(|(size_class, version)| ModelInfo {
            size_class,
            version,
        })
        .collect();

    let status = if models.is_empty() { "degraded" } else { "ok" };

    Json(Health {
        status,
        models,
        predictions: app.predictions.stats(),
        ingest: app.monitor.as_ref().map(|monitor| monitor.ingest_stats()),
        source: app.monitor.as_ref().map(|monitor| monitor.source_stats()),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::StatusCode;
    use axum_test::TestServer;
    use serde_json::Value;

    use super::*;
    use crate::cache::ResultCache;
    use crate::database::Database;
    use crate::features::FeatureConfig;
    use crate::predict::artifact::testing::constant;
    use crate::predict::testing::seed_video;
    use crate::predict::{ModelRegistry, PredictionService};

    async fn server(db: &Database, models: ModelRegistry) -> TestServer {
        server_with_cache(db, models, Arc::new(ResultCache::new(Duration::from_secs(60)))).await
    }

    async fn server_with_cache(db: &Database, models: ModelRegistry, cache: Arc<ResultCache>) -> TestServer {
        let predictions = PredictionService::new(db.clone(), cache, models, FeatureConfig::default());

        TestServer::new(create_router(App::new(Arc::new(predictions)))).unwrap()
    }

    #[tokio::test]
    async fn returns_forecast() {
        let db = Database::memory().await.unwrap();
        seed_video(&db, "dQw4w9WgXcQ", 30, &[0, 1000]).await;

        let models = ModelRegistry::new(Some(constant(SizeClass::Short, 420.0)), None);
        let server = server(&db, models).await;

        let response = server.get("/videos/dQw4w9WgXcQ/prediction").await;
        response.assert_status_ok();

        let body: Value = response.json();
        assert_eq!(body["point_estimate"], 420);
        assert_eq!(body["size_class"], "short");
        assert_eq!(body["curve"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn unknown_video_is_404() {
        let db = Database::memory().await.unwrap();
        let server = server(&db, ModelRegistry::default()).await;

        let response = server.get("/videos/dQw4w9WgXcQ/prediction").await;
        response.assert_status(StatusCode::NOT_FOUND);

        let body: Value = response.json();
        assert_eq!(body["reason"], "unknown_video");
    }

    #[tokio::test]
    async fn insufficient_history_is_422() {
        let db = Database::memory().await.unwrap();
        seed_video(&db, "dQw4w9WgXcQ", 600, &[5]).await;

        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 1.0)));
        let server = server(&db, models).await;

        let response = server.get("/videos/dQw4w9WgXcQ/prediction").await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(response.json::<Value>()["reason"], "insufficient_features");
    }

    #[tokio::test]
    async fn superseded_forecast_is_409() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 600, &[5, 10]).await;

        let cache = Arc::new(ResultCache::new(Duration::from_secs(60)));
        cache.invalidate(&video, crate::model::SnapshotId(3));

        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 1.0)));
        let server = server_with_cache(&db, models, cache).await;

        let response = server.get("/videos/dQw4w9WgXcQ/prediction").await;
        response.assert_status(StatusCode::CONFLICT);
        assert_eq!(response.json::<Value>()["reason"], "superseded");
    }

    #[tokio::test]
    async fn missing_model_is_503() {
        let db = Database::memory().await.unwrap();
        seed_video(&db, "dQw4w9WgXcQ", 600, &[5, 10]).await;

        let server = server(&db, ModelRegistry::default()).await;

        let response = server.get("/videos/dQw4w9WgXcQ/prediction").await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.json::<Value>()["reason"], "model_unavailable");
    }

    #[tokio::test]
    async fn invalid_id_is_400() {
        let db = Database::memory().await.unwrap();
        let server = server(&db, ModelRegistry::default()).await;

        let response = server.get("/videos/nope/prediction").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["reason"], "invalid_video_id");
    }

    #[tokio::test]
    async fn health_reports_models() {
        let db = Database::memory().await.unwrap();
        let models = ModelRegistry::new(Some(constant(SizeClass::Short, 1.0)), None);
        let server = server(&db, models).await;

        let response = server.get("/health").await;
        response.assert_status_ok();

        let body: Value = response.json();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["models"][0]["size_class"], "short");
        assert_eq!(body["ingest"], Value::Null);
    }
}
