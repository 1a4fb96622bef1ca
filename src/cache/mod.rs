//! Forecasts keyed by `(video, basis snapshot)`.
//!
//! Entries of one video live together in a single [DashMap] slot, so every read and write of a
//! video's forecasts happens under that slot's shard lock.

use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;
use derive_new::new;
use serde::Serialize;

use crate::model::{now, PredictionResult, SnapshotId, Timestamp, VideoId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, new)]
pub struct CacheKey {
    pub video_id: VideoId,
    pub basis: SnapshotId,
}

impl CacheKey {
    pub fn of(result: &PredictionResult) -> Self {
        Self::new(result.video_id.clone(), result.basis)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    result: PredictionResult,
    expires_at: Timestamp,
}

#[derive(Debug, Default)]
struct VideoEntries {
    /// Puts on a basis older than this are refused.
    floor: Option<SnapshotId>,
    results: BTreeMap<SnapshotId, Entry>,
}

impl VideoEntries {
    fn accepts(&self, basis: SnapshotId) -> bool {
        self.floor.map_or(true, |floor| basis >= floor)
    }

    fn drain_expired(&mut self, now: Timestamp) -> usize {
        let before = self.results.len();
        self.results.retain(|_, entry| entry.expires_at > now);
        before - self.results.len()
    }
}

#[derive(Debug)]
pub struct ResultCache {
    videos: DashMap<VideoId, VideoEntries>,
    default_ttl: Duration,
}

impl ResultCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            videos: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<PredictionResult> {
        self.get_at(key, now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Timestamp) -> Option<PredictionResult> {
        let entries = self.videos.get(&key.video_id)?;
        let result = entries
            .results
            .get(&key.basis)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.result.clone());
        result
    }

    /// Returns `false` when the key's basis was already superseded by [ResultCache::invalidate].
    pub fn put(&self, key: CacheKey, result: PredictionResult, ttl: Duration) -> bool {
        self.put_at(key, result, ttl, now())
    }

    pub fn put_at(&self, key: CacheKey, result: PredictionResult, ttl: Duration, now: Timestamp) -> bool {
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52));

        let mut entries = self.videos.entry(key.video_id).or_default();
        if !entries.accepts(key.basis) {
            tracing::debug!(basis = %key.basis, "refusing forecast on a superseded snapshot");
            return false;
        }

        entries.results.insert(key.basis, Entry { result, expires_at });
        true
    }

    /// Drop every forecast of `video` computed from a snapshot older than `newer`. Returns the
    /// number of entries removed.
    pub fn invalidate(&self, video: &VideoId, newer: SnapshotId) -> usize {
        let mut entries = self.videos.entry(video.clone()).or_default();

        let floor = entries.floor.map_or(newer, |floor| floor.max(newer));
        entries.floor = Some(floor);

        let before = entries.results.len();
        entries.results.retain(|basis, _| *basis >= newer);
        before - entries.results.len()
    }

    /// Remove entries whose time to live has passed. Returns the number of entries removed.
    pub fn purge_expired(&self, now: Timestamp) -> usize {
        let mut removed = 0;
        for mut entries in self.videos.iter_mut() {
            removed += entries.drain_expired(now);
        }

        if removed > 0 {
            tracing::debug!(removed, "purged expired forecasts");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.videos.iter().map(|entries| entries.results.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForecastPoint, Horizon, SizeClass};

    fn at(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn video() -> VideoId {
        "dQw4w9WgXcQ".parse().unwrap()
    }

    fn result(basis: u64, views: u64) -> PredictionResult {
        PredictionResult {
            video_id: video(),
            basis: SnapshotId(basis),
            generated_at: at("2024-03-01T10:00:00Z"),
            size_class: SizeClass::Long,
            model_version: "test".to_string(),
            curve: vec![ForecastPoint::new(Horizon::hours(1), views)],
            point_estimate: views,
        }
    }

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn returns_what_was_put() {
        let cache = ResultCache::new(HOUR);
        let forecast = result(1, 500);
        let key = CacheKey::of(&forecast);

        assert!(cache.put(key.clone(), forecast.clone(), HOUR));
        assert_eq!(cache.get(&key), Some(forecast));
        assert_eq!(cache.get(&CacheKey::new(video(), SnapshotId(2))), None);
    }

    #[test]
    fn invalidation_drops_older_bases() {
        let cache = ResultCache::new(HOUR);
        cache.put(CacheKey::new(video(), SnapshotId(1)), result(1, 100), HOUR);
        cache.put(CacheKey::new(video(), SnapshotId(2)), result(2, 200), HOUR);

        assert_eq!(cache.invalidate(&video(), SnapshotId(2)), 1);
        assert_eq!(cache.get(&CacheKey::new(video(), SnapshotId(1))), None);
        assert!(cache.get(&CacheKey::new(video(), SnapshotId(2))).is_some());
    }

    #[test]
    fn refuses_puts_on_superseded_basis() {
        let cache = ResultCache::new(HOUR);
        cache.invalidate(&video(), SnapshotId(3));

        let stale = CacheKey::new(video(), SnapshotId(2));
        assert!(!cache.put(stale.clone(), result(2, 200), HOUR));
        assert_eq!(cache.get(&stale), None);

        assert!(cache.put(CacheKey::new(video(), SnapshotId(3)), result(3, 300), HOUR));
    }

    #[test]
    fn invalidation_never_lowers_the_floor() {
        let cache = ResultCache::new(HOUR);
        cache.invalidate(&video(), SnapshotId(5));
        cache.invalidate(&video(), SnapshotId(2));

        assert!(!cache.put(CacheKey::new(video(), SnapshotId(4)), result(4, 1), HOUR));
    }

    #[test]
    fn expired_entries_are_hidden_and_purged() {
        let cache = ResultCache::new(HOUR);
        let put_at = at("2024-03-01T10:00:00Z");
        let key = CacheKey::new(video(), SnapshotId(1));

        cache.put_at(key.clone(), result(1, 100), HOUR, put_at);
        assert!(cache.get_at(&key, at("2024-03-01T10:59:59Z")).is_some());
        assert!(cache.get_at(&key, at("2024-03-01T11:00:00Z")).is_none());

        assert_eq!(cache.purge_expired(at("2024-03-01T11:00:00Z")), 1);
        assert!(cache.is_empty());
    }
}
