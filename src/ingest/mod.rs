//! Pulls channels, videos and snapshots from the source into the database.
//!
//! A failing record never aborts the batch on its own. Once enough records were attempted, a run
//! whose failure ratio exceeds the configured threshold is aborted with
//! [IngestError::IngestionDegraded].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use futures::stream::{self, Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr};
use snafu::{ensure, Location, ResultExt as _, Snafu};
use tracing::instrument;

use crate::cache::ResultCache;
use crate::database::{Database, DatabaseError};
use crate::model::{now, Channel, ChannelId, Snapshot, Timestamp, Video, VideoId};
use crate::source::{Adapter, AdapterStats, MalformedSnafu, Request, SourceError, VideoSource};

pub use scheduler::Scheduler;

pub mod scheduler;

pub type Result<T, E = IngestError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum IngestError {
    /// The source no longer knows the video. It has been marked inactive.
    #[snafu(display("video `{video_id}` is gone from the source"))]
    StaleVideo {
        video_id: VideoId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "ingestion degraded: {failed} of {attempted} records failed (threshold {threshold})"
    ))]
    IngestionDegraded {
        attempted: u64,
        failed: u64,
        threshold: f64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("channel `{channel_id}` was rejected: {reason}"))]
    InvalidCandidate {
        channel_id: ChannelId,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("source error: {source}"))]
    Source {
        source: SourceError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("database error: {source}"))]
    Database {
        source: DatabaseError,
        #[snafu(implicit)]
        location: Location,
    },
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Channels to start discovery from.
    #[serde(default)]
    pub seeds: Vec<ChannelId>,
    /// ISO 3166 country code channels are expected to report.
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    /// Records a run must have attempted before the failure threshold applies.
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_start_at")]
    pub start_at: Timestamp,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_interval")]
    pub interval: humantime::Duration,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_cache_sweep")]
    pub cache_sweep: humantime::Duration,
}

fn default_region() -> String {
    "LK".to_string()
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_min_sample() -> u64 {
    10
}

fn default_concurrency() -> usize {
    8
}

fn default_start_at() -> Timestamp {
    Timestamp::parse("2024-01-01T00:00:00+05:30").unwrap_or_else(|_| now())
}

fn default_interval() -> humantime::Duration {
    Duration::from_secs(60 * 60).into()
}

fn default_cache_sweep() -> humantime::Duration {
    Duration::from_secs(10 * 60).into()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            region: default_region(),
            failure_threshold: default_failure_threshold(),
            min_sample: default_min_sample(),
            concurrency: default_concurrency(),
            start_at: default_start_at(),
            interval: default_interval(),
            cache_sweep: default_cache_sweep(),
        }
    }
}

/// Whether the channel looks like it belongs to the region: it reports the region's country code,
/// or its title or description is written in Sinhala or Tamil script.
pub fn is_regional(channel: &Channel, region: &str) -> bool {
    let country = channel
        .country
        .as_deref()
        .is_some_and(|country| country.eq_ignore_ascii_case(region));

    country || has_local_script(&channel.title) || has_local_script(&channel.description)
}

fn has_local_script(text: &str) -> bool {
    const SINHALA: std::ops::RangeInclusive<char> = '\u{0D80}'..='\u{0DFF}';
    const TAMIL: std::ops::RangeInclusive<char> = '\u{0B80}'..='\u{0BFF}';

    text.chars().any(|c| SINHALA.contains(&c) || TAMIL.contains(&c))
}

#[derive(Debug, Default)]
struct IngestCounters {
    attempted: AtomicU64,
    failed: AtomicU64,
    invalid_candidates: AtomicU64,
    stale_videos: AtomicU64,
    new_videos: AtomicU64,
    snapshots: AtomicU64,
}

/// Totals since the pipeline was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct IngestStats {
    pub attempted: u64,
    pub failed: u64,
    pub invalid_candidates: u64,
    pub stale_videos: u64,
    pub new_videos: u64,
    pub snapshots: u64,
}

impl IngestStats {
    fn since(self, baseline: IngestStats) -> IngestStats {
        IngestStats {
            attempted: self.attempted - baseline.attempted,
            failed: self.failed - baseline.failed,
            invalid_candidates: self.invalid_candidates - baseline.invalid_candidates,
            stale_videos: self.stale_videos - baseline.stale_videos,
            new_videos: self.new_videos - baseline.new_videos,
            snapshots: self.snapshots - baseline.snapshots,
        }
    }
}

/// Outcome of one [Pipeline::run].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    pub channels: usize,
    #[serde(flatten)]
    pub stats: IngestStats,
}

#[derive(Debug)]
pub struct Pipeline<S> {
    adapter: Arc<Adapter<S>>,
    db: Database,
    cache: Arc<ResultCache>,
    config: IngestConfig,
    counters: IngestCounters,
}

impl<S: VideoSource> Pipeline<S> {
    pub fn new(adapter: Arc<Adapter<S>>, db: Database, cache: Arc<ResultCache>, config: IngestConfig) -> Self {
        Self {
            adapter,
            db,
            cache,
            config,
            counters: IngestCounters::default(),
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn stats(&self) -> IngestStats {
        let c = &self.counters;
        IngestStats {
            attempted: c.attempted.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            invalid_candidates: c.invalid_candidates.load(Ordering::Relaxed),
            stale_videos: c.stale_videos.load(Ordering::Relaxed),
            new_videos: c.new_videos.load(Ordering::Relaxed),
            snapshots: c.snapshots.load(Ordering::Relaxed),
        }
    }

    /// Fetch, validate and upsert each seed channel. Candidates that fail validation or cannot
    /// be fetched are logged, counted and skipped.
    pub fn discover_channels(&self, seeds: Vec<ChannelId>) -> impl Stream<Item = Channel> + '_ {
        stream::iter(seeds)
            .map(move |channel_id| self.discover_channel(channel_id))
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(future::ready)
    }

    async fn discover_channel(&self, channel_id: ChannelId) -> Option<Channel> {
        match self.try_discover_channel(&channel_id).await {
            Ok(channel) => Some(channel),
            Err(error @ IngestError::InvalidCandidate { .. }) => {
                self.counters.invalid_candidates.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%channel_id, %error, "dropping channel candidate");
                None
            }
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%channel_id, %error, "failed to discover channel");
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn try_discover_channel(&self, channel_id: &ChannelId) -> Result<Channel> {
        let request = Request::Channel(channel_id.clone());

        let fetched = self.adapter.fetch(request.clone()).await;
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);

        let channel = match fetched {
            Err(error) if error.is_not_found() => {
                // a channel we already track disappeared
                Channel::deactivate(channel_id.clone(), &self.db)
                    .await
                    .context(DatabaseSnafu)?;
                return Err(error).context(SourceSnafu);
            }
            fetched => fetched
                .and_then(|record| record.into_channel(&request))
                .context(SourceSnafu)?,
        };

        ensure!(
            channel.channel_id == *channel_id,
            InvalidCandidateSnafu {
                channel_id: channel_id.clone(),
                reason: format!("source answered with channel `{}`", channel.channel_id),
            }
        );
        ensure!(
            is_regional(&channel, &self.config.region),
            InvalidCandidateSnafu {
                channel_id: channel_id.clone(),
                reason: format!("not a {} channel", self.config.region),
            }
        );

        Channel::upsert(channel_id.clone(), channel.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?;

        tracing::debug!(title = %channel.title, subscribers = channel.subscribers, "upserted channel");
        Ok(channel)
    }

    /// Store the channel's uploads that are not in the database yet, along with their first
    /// snapshot.
    pub fn ingest_videos<'a>(&'a self, channel: &'a Channel) -> impl Stream<Item = Video> + 'a {
        stream::once(self.new_uploads(channel))
            .flat_map(stream::iter)
            .map(move |video_id| self.ingest_video(channel, video_id))
            .buffer_unordered(self.config.concurrency.max(1))
            .filter_map(future::ready)
    }

    async fn new_uploads(&self, channel: &Channel) -> Vec<VideoId> {
        match self.try_new_uploads(&channel.channel_id).await {
            Ok(uploads) => uploads,
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(channel_id = %channel.channel_id, %error, "failed to list uploads");
                Vec::new()
            }
        }
    }

    #[instrument(skip(self))]
    async fn try_new_uploads(&self, channel_id: &ChannelId) -> Result<Vec<VideoId>> {
        let request = Request::Uploads(channel_id.clone());

        let fetched = self.adapter.fetch(request.clone()).await;
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);
        let uploads = fetched
            .and_then(|record| record.into_uploads(&request))
            .context(SourceSnafu)?;

        let mut seen: HashSet<VideoId> = Video::known_ids(channel_id.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?
            .into_iter()
            .collect();

        let fresh: Vec<VideoId> = uploads.into_iter().filter(|id| seen.insert(id.clone())).collect();
        tracing::debug!(new = fresh.len(), "listed uploads");

        Ok(fresh)
    }

    async fn ingest_video(&self, channel: &Channel, video_id: VideoId) -> Option<Video> {
        match self.try_ingest_video(channel, &video_id).await {
            Ok(video) => Some(video),
            Err(error) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%video_id, %error, "failed to ingest video");
                None
            }
        }
    }

    #[instrument(skip(self, channel), fields(channel_id = %channel.channel_id))]
    async fn try_ingest_video(&self, channel: &Channel, video_id: &VideoId) -> Result<Video> {
        let request = Request::Video(video_id.clone());

        let fetched = self.adapter.fetch(request.clone()).await;
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);
        let record = fetched
            .and_then(|record| record.into_video(&request))
            .context(SourceSnafu)?;

        let metadata = &record.metadata;
        if metadata.video_id != *video_id || metadata.channel_id != channel.channel_id {
            let mismatch = MalformedSnafu {
                resource: request.to_string(),
                message: format!(
                    "source answered with video `{}` of channel `{}`",
                    metadata.video_id, metadata.channel_id
                ),
            };
            return mismatch.fail().context(SourceSnafu);
        }

        let video = Video::from_metadata(record.metadata);
        Video::create(video_id.clone(), video.clone(), &self.db)
            .await
            .context(DatabaseSnafu)?;
        self.counters.new_videos.fetch_add(1, Ordering::Relaxed);

        self.append(video_id, record.counters).await?;

        tracing::info!(size_class = %video.size_class, title = %video.title, "ingested video");
        Ok(video)
    }

    /// Capture the current counters of `video`. A video the source no longer knows is marked
    /// inactive and reported as [IngestError::StaleVideo].
    #[instrument(skip(self, video), fields(video_id = %video.video_id))]
    pub async fn capture_snapshot(&self, video: &Video) -> Result<Snapshot> {
        let video_id = &video.video_id;
        let request = Request::Video(video_id.clone());

        let fetched = self.adapter.fetch(request.clone()).await;
        self.counters.attempted.fetch_add(1, Ordering::Relaxed);

        let record = match fetched {
            Err(error) if error.is_not_found() => {
                Video::deactivate(video_id.clone(), &self.db)
                    .await
                    .context(DatabaseSnafu)?;
                self.counters.stale_videos.fetch_add(1, Ordering::Relaxed);
                tracing::info!("video is gone from the source, marked inactive");
                return StaleVideoSnafu {
                    video_id: video_id.clone(),
                }
                .fail();
            }
            fetched => fetched
                .and_then(|record| record.into_video(&request))
                .context(SourceSnafu)?,
        };

        if let Some(corrected) = video.corrected(&record.metadata) {
            tracing::info!(title = %corrected.title, "correcting video metadata");
            Video::replace(video_id.clone(), corrected, &self.db)
                .await
                .context(DatabaseSnafu)?;
        }

        self.append(video_id, record.counters).await
    }

    async fn append(&self, video_id: &VideoId, counters: crate::model::Counters) -> Result<Snapshot> {
        let snapshot = Snapshot::append(video_id, now(), counters, &self.db)
            .await
            .context(DatabaseSnafu)?;
        self.counters.snapshots.fetch_add(1, Ordering::Relaxed);

        let dropped = self.cache.invalidate(video_id, snapshot.seq);
        if dropped > 0 {
            tracing::debug!(dropped, "invalidated cached forecasts");
        }

        Ok(snapshot)
    }

    fn ensure_healthy(&self, baseline: IngestStats) -> Result<()> {
        let run = self.stats().since(baseline);
        let threshold = self.config.failure_threshold;

        if run.attempted < self.config.min_sample.max(1) {
            return Ok(());
        }

        let ratio = run.failed as f64 / run.attempted as f64;
        ensure!(
            ratio <= threshold,
            IngestionDegradedSnafu {
                attempted: run.attempted,
                failed: run.failed,
                threshold,
            }
        );
        Ok(())
    }

    /// Discover `seeds`, ingest their new uploads and snapshot every active video of each
    /// discovered channel.
    #[instrument(skip_all, fields(seeds = seeds.len()))]
    pub async fn run(&self, seeds: Vec<ChannelId>) -> Result<RunReport> {
        let started_at = now();
        let baseline = self.stats();

        let channels: Vec<Channel> = self.discover_channels(seeds).collect().await;
        self.ensure_healthy(baseline)?;

        for channel in &channels {
            let fresh: HashSet<VideoId> = self
                .ingest_videos(channel)
                .map(|video| video.video_id)
                .collect()
                .await;
            self.ensure_healthy(baseline)?;

            let videos = Video::by_channel(channel.channel_id.clone(), true, &self.db)
                .await
                .context(DatabaseSnafu)?;

            let mut pending = Vec::new();
            for video in &videos {
                if !fresh.contains(&video.video_id) {
                    pending.push(self.capture_snapshot(video));
                }
            }
            let mut captures = stream::iter(pending)
                .buffer_unordered(self.config.concurrency.max(1));

            while let Some(captured) = captures.next().await {
                match captured {
                    Ok(_) | Err(IngestError::StaleVideo { .. }) => {}
                    Err(error) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(%error, "failed to capture snapshot");
                    }
                }
                self.ensure_healthy(baseline)?;
            }
        }

        let report = RunReport {
            started_at,
            finished_at: now(),
            channels: channels.len(),
            stats: self.stats().since(baseline),
        };

        tracing::info!(
            channels = report.channels,
            attempted = report.stats.attempted,
            failed = report.stats.failed,
            snapshots = report.stats.snapshots,
            "ingestion run finished"
        );

        Ok(report)
    }
}

/// Read-only view of a running pipeline, for health reporting.
pub trait IngestMonitor: Send + Sync {
    fn ingest_stats(&self) -> IngestStats;
    fn source_stats(&self) -> AdapterStats;
}

impl<S: VideoSource> IngestMonitor for Pipeline<S> {
    fn ingest_stats(&self) -> IngestStats {
        self.stats()
    }

    fn source_stats(&self) -> AdapterStats {
        self.adapter.stats()
    }
}
