//! Turns a video, its channel and its snapshot history into a [FeatureVector].
//!
//! Everything in here is pure: the same inputs always produce the same vector.

use std::cmp::Reverse;
use std::collections::BTreeMap;

use chrono::{FixedOffset, Offset as _, Utc};
use derive_new::new;
use serde::Serialize;

use crate::model::{SizeClass, Snapshot, SnapshotId, Video, VideoId};

pub mod names {
    pub const PUBLISH_HOUR: &str = "publish_hour";
    pub const PUBLISH_WEEKDAY: &str = "publish_weekday";
    pub const HOURS_SINCE_PUBLISH: &str = "hours_since_publish";
    pub const TITLE_LENGTH: &str = "title_length";
    pub const DESCRIPTION_LENGTH: &str = "description_length";
    pub const TAG_COUNT: &str = "tag_count";
    pub const HAS_KEYWORD: &str = "has_keyword";
    pub const KEYWORD_COUNT: &str = "keyword_count";
    pub const CHANNEL_AUTHORITY: &str = "channel_authority";
    pub const CHANNEL_SUBSCRIBERS: &str = "channel_subscribers";
    pub const CHANNEL_VIDEO_COUNT: &str = "channel_video_count";
    pub const EARLY_LIKE_RATIO: &str = "early_like_ratio";
    pub const EARLY_COMMENT_RATIO: &str = "early_comment_ratio";
    pub const VIEW_VELOCITY: &str = "view_velocity";
    pub const LIKE_VELOCITY: &str = "like_velocity";
    pub const IS_SHORT: &str = "is_short";
}

/// Colombo, UTC+05:30.
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 5 * 60 + 30;

pub fn default_keywords() -> Vec<String> {
    ["sri lanka", "srilanka", "lanka", "colombo", "kandy", "galle", "jaffna", "sinhala"]
        .into_iter()
        .map(String::from)
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    pub local_offset: FixedOffset,
    /// Matched case-insensitively against title and description.
    pub keywords: Vec<String>,
}

impl FeatureConfig {
    /// Falls back to UTC+05:30 when the offset is out of range.
    pub fn new(utc_offset_minutes: i32, keywords: Vec<String>) -> Self {
        let local_offset = utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .or_else(|| FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60))
            .unwrap_or_else(|| Utc.fix());

        let keywords = keywords
            .into_iter()
            .map(|keyword| keyword.trim().to_lowercase())
            .filter(|keyword| !keyword.is_empty())
            .collect();

        Self {
            local_offset,
            keywords,
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self::new(DEFAULT_UTC_OFFSET_MINUTES, default_keywords())
    }
}

/// What the engine needs to know about the owning channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, new)]
pub struct ChannelProfile {
    pub subscribers: u64,
    /// Median of the latest view counts of the channel's videos.
    pub median_views: u64,
    /// Uploads reported by the source for the whole channel.
    pub video_count: u64,
}

impl ChannelProfile {
    pub fn from_latest_views(subscribers: u64, video_count: u64, mut views: Vec<u64>) -> Self {
        views.sort_unstable();

        let median_views = match views.len() {
            0 => 0,
            n if n % 2 == 1 => views[n / 2],
            n => (views[n / 2 - 1] + views[n / 2]) / 2,
        };

        Self::new(subscribers, median_views, video_count)
    }

    /// Monotonically non-decreasing in both subscribers and median views.
    pub fn authority_score(&self) -> f64 {
        let subscribers = (self.subscribers as f64).ln_1p();
        let views = (self.median_views as f64).ln_1p();
        0.5 * subscribers + 0.5 * views
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FeatureInput<'a> {
    pub video: &'a Video,
    pub channel: &'a ChannelProfile,
    /// Ordered by sequence number.
    pub history: &'a [Snapshot],
}

/// Features of one video as of its latest snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureVector {
    pub video_id: VideoId,
    /// The latest snapshot the vector was computed from.
    pub basis: Option<SnapshotId>,
    pub size_class: SizeClass,
    pub values: BTreeMap<String, f64>,
    /// Set when velocity features could not be derived.
    pub insufficient_history: bool,
}

impl FeatureVector {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

pub fn compute_features(input: FeatureInput<'_>, config: &FeatureConfig) -> FeatureVector {
    let FeatureInput {
        video,
        channel,
        history,
    } = input;

    let mut values = BTreeMap::new();
    let mut set = |name: &str, value: f64| {
        values.insert(name.to_string(), value);
    };

    let (hour, weekday) = video.published_at.local_hour_and_weekday(config.local_offset);
    set(names::PUBLISH_HOUR, hour.into());
    set(names::PUBLISH_WEEKDAY, weekday.into());

    let latest = history.last();
    let age = latest
        .map(|snapshot| hours_between(video.published_at, snapshot.captured_at).max(0.0))
        .unwrap_or(0.0);
    set(names::HOURS_SINCE_PUBLISH, age);

    set(names::TITLE_LENGTH, video.title.chars().count() as f64);
    set(names::DESCRIPTION_LENGTH, video.description.chars().count() as f64);
    set(names::TAG_COUNT, video.tags.len() as f64);

    let keywords = keyword_count(video, &config.keywords);
    set(names::HAS_KEYWORD, if keywords > 0 { 1.0 } else { 0.0 });
    set(names::KEYWORD_COUNT, keywords as f64);

    set(names::CHANNEL_AUTHORITY, channel.authority_score());
    set(names::CHANNEL_SUBSCRIBERS, channel.subscribers as f64);
    set(names::CHANNEL_VIDEO_COUNT, channel.video_count as f64);

    let (like_ratio, comment_ratio) = early_engagement(video, history);
    set(names::EARLY_LIKE_RATIO, like_ratio);
    set(names::EARLY_COMMENT_RATIO, comment_ratio);

    set(
        names::IS_SHORT,
        match video.size_class {
            SizeClass::Short => 1.0,
            SizeClass::Long => 0.0,
        },
    );

    let insufficient_history = match (history.first(), latest) {
        (Some(first), Some(latest)) if history.len() >= 2 => {
            let hours = hours_between(first.captured_at, latest.captured_at);
            if hours > 0.0 {
                set(names::VIEW_VELOCITY, (latest.views as f64 - first.views as f64) / hours);
                set(names::LIKE_VELOCITY, (latest.likes as f64 - first.likes as f64) / hours);
                false
            } else {
                true
            }
        }
        _ => true,
    };

    FeatureVector {
        video_id: video.video_id.clone(),
        basis: latest.map(|snapshot| snapshot.seq),
        size_class: video.size_class,
        values,
        insufficient_history,
    }
}

fn hours_between(from: crate::model::Timestamp, to: crate::model::Timestamp) -> f64 {
    (to - from).num_seconds() as f64 / 3600.0
}

/// Keyword mentions in the title and description. Matches never overlap and the longest keyword
/// wins at each position, so "sri lanka" is one mention even though "lanka" is also a keyword.
fn keyword_count(video: &Video, keywords: &[String]) -> usize {
    let text = format!("{}\n{}", video.title, video.description).to_lowercase();

    let mut keywords: Vec<&str> = keywords
        .iter()
        .map(String::as_str)
        .filter(|keyword| !keyword.is_empty())
        .collect();
    keywords.sort_by_key(|keyword| Reverse(keyword.len()));

    let mut count = 0;
    let mut rest = text.as_str();
    while let Some(c) = rest.chars().next() {
        match keywords.iter().find(|keyword| rest.starts_with(**keyword)) {
            Some(keyword) => {
                count += 1;
                rest = &rest[keyword.len()..];
            }
            None => rest = &rest[c.len_utf8()..],
        }
    }

    count
}

/// Like/view and comment/view ratios at the earliest snapshot taken after publishing that has any
/// views. Zero when no such snapshot exists.
fn early_engagement(video: &Video, history: &[Snapshot]) -> (f64, f64) {
    let window = history
        .iter()
        .find(|snapshot| snapshot.captured_at >= video.published_at && snapshot.views > 0);

    match window {
        Some(snapshot) => {
            let views = snapshot.views as f64;
            (snapshot.likes as f64 / views, snapshot.comments as f64 / views)
        }
        None => (0.0, 0.0),
    }
}
