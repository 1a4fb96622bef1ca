use super::*;

/// A forecast offset measured from the basis snapshot's capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Horizon {
    pub hours: u32,
}

impl Horizon {
    pub const fn hours(hours: u32) -> Self {
        Self { hours }
    }

    pub fn duration(self) -> Duration {
        Duration::hours(self.hours.into())
    }
}

/// 1 hour, 6 hours, 1 day and 1 week ahead.
pub const DEFAULT_HORIZONS: [Horizon; 4] = [
    Horizon::hours(1),
    Horizon::hours(6),
    Horizon::hours(24),
    Horizon::hours(24 * 7),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, new)]
pub struct ForecastPoint {
    pub offset: Horizon,
    pub views: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PredictionResult {
    pub video_id: VideoId,
    pub basis: SnapshotId,
    pub generated_at: Timestamp,
    pub size_class: SizeClass,
    pub model_version: String,
    /// Ordered by offset.
    pub curve: Vec<ForecastPoint>,
    /// The forecast at the furthest offset.
    pub point_estimate: u64,
}
