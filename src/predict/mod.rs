//! Forecasts the view-count curve of a video from its latest feature vector.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use snafu::{ensure, Location, OptionExt as _, ResultExt as _, Snafu};
use tracing::instrument;

use crate::cache::{CacheKey, ResultCache};
use crate::database::{Database, DatabaseError};
use crate::features::{
    compute_features, default_keywords, ChannelProfile, FeatureConfig, FeatureInput, FeatureVector,
    DEFAULT_UTC_OFFSET_MINUTES,
};
use crate::model::{
    now, Channel, ChannelId, ForecastPoint, Horizon, PredictionResult, SizeClass, Snapshot, Video,
    VideoId, DEFAULT_HORIZONS,
};

pub use artifact::{Artifact, ArtifactError};

pub mod artifact;

pub type Result<T, E = PredictionError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PredictionError {
    #[snafu(display("video `{video_id}` is not known"))]
    UnknownVideo {
        video_id: VideoId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("video `{video_id}` has {snapshots} snapshot(s), at least 2 are needed"))]
    InsufficientFeatures {
        video_id: VideoId,
        snapshots: usize,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("no model is loaded for {size_class} videos"))]
    ModelUnavailable {
        size_class: SizeClass,
        #[snafu(implicit)]
        location: Location,
    },

    /// A newer snapshot arrived while the forecast was being computed.
    #[snafu(display("forecast for `{}` was superseded by a newer snapshot", key.video_id))]
    Superseded {
        key: CacheKey,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("prediction request cannot move from {from:?} to {to:?}"))]
    InvalidTransition {
        from: RequestState,
        to: RequestState,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("database error while predicting: {source}"))]
    Database {
        source: DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
}

impl PredictionError {
    /// Stable code reported to API clients.
    pub fn reason(&self) -> &'static str {
        match self {
            PredictionError::UnknownVideo { .. } => "unknown_video",
            PredictionError::InsufficientFeatures { .. } => "insufficient_features",
            PredictionError::ModelUnavailable { .. } => "model_unavailable",
            PredictionError::Superseded { .. } => "superseded",
            PredictionError::InvalidTransition { .. } => "internal",
            PredictionError::Database { .. } => "database",
        }
    }
}

/// Lifecycle of a single prediction request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RequestState {
    Received,
    FeaturesReady,
    Inferred,
    Cached,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Cached | RequestState::Failed)
    }

    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;

        match (self, next) {
            (Received, FeaturesReady) | (FeaturesReady, Inferred) | (Inferred, Cached) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn advance(self, next: RequestState) -> Result<RequestState> {
        ensure!(
            self.can_advance_to(next),
            InvalidTransitionSnafu {
                from: self,
                to: next
            }
        );
        Ok(next)
    }
}

/// Something that maps a feature vector to a raw view count at a forecast offset.
pub trait Regressor {
    fn version(&self) -> &str;

    /// The raw output may be negative or fractional.
    fn infer(&self, features: &FeatureVector, offset: Horizon) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    ShortForm(Artifact),
    LongForm(Artifact),
}

impl Model {
    fn artifact(&self) -> &Artifact {
        match self {
            Model::ShortForm(artifact) | Model::LongForm(artifact) => artifact,
        }
    }

    pub fn size_class(&self) -> SizeClass {
        match self {
            Model::ShortForm(_) => SizeClass::Short,
            Model::LongForm(_) => SizeClass::Long,
        }
    }
}

impl Regressor for Model {
    fn version(&self) -> &str {
        self.artifact().version()
    }

    fn infer(&self, features: &FeatureVector, offset: Horizon) -> f64 {
        self.artifact().evaluate(features, offset)
    }
}

/// The models currently loaded, at most one per size class.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    short: Option<Model>,
    long: Option<Model>,
}

impl ModelRegistry {
    pub fn new(short: Option<Artifact>, long: Option<Artifact>) -> Self {
        Self {
            short: short.map(Model::ShortForm),
            long: long.map(Model::LongForm),
        }
    }

    /// Load `short.json` and `long.json` from `directory`. A missing file leaves its class
    /// without a model; an invalid one is an error.
    #[instrument]
    pub fn load(directory: &Path) -> artifact::Result<Self> {
        let load = |size_class: SizeClass| -> artifact::Result<Option<Artifact>> {
            let path = directory.join(format!("{size_class}.json"));
            if !path.exists() {
                tracing::warn!(path = %path.display(), "no model artifact, {size_class} videos cannot be predicted");
                return Ok(None);
            }

            let artifact = Artifact::load(&path, size_class)?;
            tracing::info!(version = artifact.version(), "loaded {size_class} model");
            Ok(Some(artifact))
        };

        Ok(Self::new(load(SizeClass::Short)?, load(SizeClass::Long)?))
    }

    pub fn get(&self, size_class: SizeClass) -> Option<&Model> {
        match size_class {
            SizeClass::Short => self.short.as_ref(),
            SizeClass::Long => self.long.as_ref(),
        }
    }

    pub fn versions(&self) -> Vec<(SizeClass, String)> {
        [&self.short, &self.long]
            .into_iter()
            .flatten()
            .map(|model| (model.size_class(), model.version().to_string()))
            .collect()
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct PredictConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: std::path::PathBuf,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: humantime::Duration,
    #[serde(default = "default_offset")]
    pub utc_offset_minutes: i32,
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
}

fn default_model_dir() -> std::path::PathBuf {
    "models".into()
}

fn default_cache_ttl() -> humantime::Duration {
    Duration::from_secs(6 * 60 * 60).into()
}

fn default_offset() -> i32 {
    DEFAULT_UTC_OFFSET_MINUTES
}

impl PredictConfig {
    pub fn features(&self) -> FeatureConfig {
        FeatureConfig::new(self.utc_offset_minutes, self.keywords.clone())
    }
}

#[derive(Debug, Default)]
struct PredictionCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PredictionStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub failures: u64,
}

/// Non-negative whole views. Negative and NaN outputs are 0; outputs past `u64::MAX`, including
/// `+inf`, saturate.
pub fn clamp_views(raw: f64) -> u64 {
    if raw.is_nan() || raw <= 0.0 {
        0
    } else if raw >= u64::MAX as f64 {
        u64::MAX
    } else {
        raw.round() as u64
    }
}

#[derive(Debug)]
pub struct PredictionService {
    db: Database,
    cache: Arc<ResultCache>,
    models: ModelRegistry,
    features: FeatureConfig,
    horizons: Vec<Horizon>,
    counters: PredictionCounters,
}

impl PredictionService {
    pub fn new(
        db: Database, cache: Arc<ResultCache>, models: ModelRegistry, features: FeatureConfig,
    ) -> Self {
        Self {
            db,
            cache,
            models,
            features,
            horizons: DEFAULT_HORIZONS.to_vec(),
            counters: PredictionCounters::default(),
        }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn stats(&self) -> PredictionStats {
        PredictionStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Forecast the growth curve of `video_id` from its latest snapshot.
    ///
    /// Forecasts are cached per basis snapshot; a cached forecast is returned as long as no newer
    /// snapshot has been captured.
    #[instrument(skip(self), fields(%video_id))]
    pub async fn predict(&self, video_id: &VideoId) -> Result<PredictionResult> {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut state = RequestState::Received;
        let outcome = self.run(video_id, &mut state).await;

        if let Err(error) = &outcome {
            self.counters.failures.fetch_add(1, Ordering::Relaxed);
            if !state.is_terminal() {
                state = RequestState::Failed;
            }
            tracing::warn!(?state, reason = error.reason(), %error, "prediction failed");
        }

        outcome
    }

    async fn run(&self, video_id: &VideoId, state: &mut RequestState) -> Result<PredictionResult> {
        let video = Video::get(video_id.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?
            .context(UnknownVideoSnafu {
                video_id: video_id.clone(),
            })?;

        let history = Snapshot::history(video_id.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?;

        let Some(latest) = history.last() else {
            return InsufficientFeaturesSnafu {
                video_id: video_id.clone(),
                snapshots: 0usize,
            }
            .fail();
        };

        let key = CacheKey::new(video_id.clone(), latest.seq);
        if let Some(cached) = self.cache.get(&key) {
            tracing::debug!(basis = %key.basis, "cache hit");
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached);
        }

        let channel = self.channel_profile(&video.channel_id).await?;
        let features = compute_features(
            FeatureInput {
                video: &video,
                channel: &channel,
                history: &history,
            },
            &self.features,
        );
        *state = state.advance(RequestState::FeaturesReady)?;

        ensure!(
            !features.insufficient_history,
            InsufficientFeaturesSnafu {
                video_id: video_id.clone(),
                snapshots: history.len(),
            }
        );

        let model = self.models.get(video.size_class).context(ModelUnavailableSnafu {
            size_class: video.size_class,
        })?;

        let result = forecast(model, &features, &self.horizons, key.basis);
        *state = state.advance(RequestState::Inferred)?;

        ensure!(
            self.cache.put(key.clone(), result.clone(), self.cache.default_ttl()),
            SupersededSnafu { key }
        );
        *state = state.advance(RequestState::Cached)?;

        tracing::info!(
            basis = %result.basis,
            model = %result.model_version,
            point_estimate = result.point_estimate,
            "forecast ready"
        );

        Ok(result)
    }

    async fn channel_profile(&self, channel_id: &ChannelId) -> Result<ChannelProfile> {
        let (subscribers, video_count) = Channel::get(channel_id.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?
            .map_or((0, 0), |channel| (channel.subscribers, channel.video_count));

        let videos = Video::by_channel(channel_id.clone(), true, &self.db)
            .await
            .context(DatabaseSnafu)?;

        let latest = try_join_all(
            videos
                .into_iter()
                .map(|video| Snapshot::latest(video.video_id, &self.db)),
        )
        .await
        .context(DatabaseSnafu)?;

        let views = latest.into_iter().flatten().map(|snapshot| snapshot.views).collect();

        Ok(ChannelProfile::from_latest_views(subscribers, video_count, views))
    }
}

/// Apply the model at every offset to the same feature vector.
fn forecast(
    model: &Model, features: &FeatureVector, horizons: &[Horizon], basis: crate::model::SnapshotId,
) -> PredictionResult {
    let mut horizons = horizons.to_vec();
    horizons.sort();

    let curve: Vec<ForecastPoint> = horizons
        .into_iter()
        .map(|offset| ForecastPoint::new(offset, clamp_views(model.infer(features, offset))))
        .collect();

    let point_estimate = curve.last().map_or(0, |point| point.views);

    PredictionResult {
        video_id: features.video_id.clone(),
        basis,
        generated_at: now(),
        size_class: model.size_class(),
        model_version: model.version().to_string(),
        curve,
        point_estimate,
    }
}


#[cfg(test)]
mod tests {
    use super::artifact::testing::constant;
    use super::testing::*;
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn service(db: &Database, models: ModelRegistry) -> PredictionService {
        PredictionService::new(
            db.clone(),
            Arc::new(ResultCache::new(HOUR)),
            models,
            FeatureConfig::default(),
        )
    }

    #[test]
    fn state_machine_transitions() {
        use RequestState::*;

        assert!(Received.advance(FeaturesReady).is_ok());
        assert!(Received.advance(Failed).is_ok());
        assert!(Inferred.advance(Cached).is_ok());

        assert!(Received.advance(Inferred).is_err());
        assert!(Cached.advance(Failed).is_err());
        assert!(Failed.advance(Received).is_err());
    }

    #[test]
    fn clamps_negative_output() {
        assert_eq!(clamp_views(-5.0), 0);
        assert_eq!(clamp_views(f64::NAN), 0);
        assert_eq!(clamp_views(12.6), 13);
        assert_eq!(clamp_views(f64::NEG_INFINITY), 0);
    }

    #[test]
    fn saturated_output_is_not_zero() {
        assert_eq!(clamp_views(f64::INFINITY), u64::MAX);
        assert_eq!(clamp_views(1e300), u64::MAX);
        assert_eq!(clamp_views(800.0_f64.exp_m1()), u64::MAX);
    }

    #[tokio::test]
    async fn negative_model_output_forecasts_zero() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 30, &[0, 1000]).await;

        let models = ModelRegistry::new(Some(constant(SizeClass::Short, -5.0)), None);
        let result = service(&db, models).predict(&video).await.unwrap();

        assert_eq!(result.size_class, SizeClass::Short);
        assert_eq!(result.curve.len(), DEFAULT_HORIZONS.len());
        assert!(result.curve.iter().all(|point| point.views == 0));
        assert_eq!(result.point_estimate, 0);
    }

    #[tokio::test]
    async fn point_estimate_is_the_longest_offset() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 600, &[10, 20, 40]).await;

        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 2500.0)));
        let result = service(&db, models).predict(&video).await.unwrap();

        let offsets: Vec<u32> = result.curve.iter().map(|point| point.offset.hours).collect();
        assert_eq!(offsets, vec![1, 6, 24, 168]);
        assert_eq!(result.point_estimate, 2500);
        assert_eq!(result.basis.0, 3);
    }

    #[tokio::test]
    async fn single_snapshot_is_insufficient() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 600, &[10]).await;

        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 1.0)));
        let service = service(&db, models);

        let error = service.predict(&video).await.unwrap_err();
        assert!(matches!(error, PredictionError::InsufficientFeatures { snapshots: 1, .. }));
        assert_eq!(service.stats().failures, 1);
    }

    #[tokio::test]
    async fn missing_model_is_unavailable() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 30, &[1, 2]).await;

        let error = service(&db, ModelRegistry::default())
            .predict(&video)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PredictionError::ModelUnavailable {
                size_class: SizeClass::Short,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unknown_video() {
        let db = Database::memory().await.unwrap();
        let error = service(&db, ModelRegistry::default())
            .predict(&"aaaaaaaaaaa".parse().unwrap())
            .await
            .unwrap_err();

        assert_eq!(error.reason(), "unknown_video");
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 600, &[10, 20]).await;

        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 7.0)));
        let service = service(&db, models);

        let first = service.predict(&video).await.unwrap();
        let second = service.predict(&video).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(service.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn newer_snapshot_during_inference_supersedes_the_forecast() {
        let db = Database::memory().await.unwrap();
        let video = seed_video(&db, "dQw4w9WgXcQ", 600, &[10, 20]).await;

        let cache = Arc::new(ResultCache::new(HOUR));
        let models = ModelRegistry::new(None, Some(constant(SizeClass::Long, 7.0)));
        let service = PredictionService::new(db.clone(), cache.clone(), models, FeatureConfig::default());

        // Ingestion appended snapshot 3 after this request read a history ending at 2.
        cache.invalidate(&video, crate::model::SnapshotId(3));

        let error = service.predict(&video).await.unwrap_err();
        match &error {
            PredictionError::Superseded { key, .. } => assert_eq!(key.basis.0, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(error.reason(), "superseded");
        assert!(cache.is_empty());
        assert_eq!(service.stats().failures, 1);
    }

    #[tokio::test]
    async fn channel_profile_uses_reported_video_count() {
        let db = Database::memory().await.unwrap();
        seed_video(&db, "dQw4w9WgXcQ", 600, &[10, 30]).await;

        let channel_id: ChannelId = "UCabc".parse().unwrap();
        let channel = Channel::new(
            channel_id.clone(),
            "Kandy Vlogs".to_string(),
            String::new(),
            Some("LK".to_string()),
            8000,
            120,
            at("2016-01-01T00:00:00Z"),
        );
        Channel::upsert(channel_id.clone(), channel, &db).await.unwrap();

        let profile = service(&db, ModelRegistry::default())
            .channel_profile(&channel_id)
            .await
            .unwrap();

        assert_eq!(profile.subscribers, 8000);
        assert_eq!(profile.video_count, 120);
        assert_eq!(profile.median_views, 30);
    }

    #[test]
    fn missing_artifacts_leave_classes_empty() {
        let registry = ModelRegistry::load(Path::new("/nonexistent/models")).unwrap();
        assert!(registry.get(SizeClass::Short).is_none());
        assert!(registry.versions().is_empty());
    }
}
