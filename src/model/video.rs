use std::collections::BTreeSet;

use super::*;

/// Videos strictly shorter than this many seconds are short-form.
pub const SHORT_FORM_THRESHOLD_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Short,
    Long,
}

impl SizeClass {
    pub fn from_duration(duration: Duration) -> Self {
        if duration < Duration::seconds(SHORT_FORM_THRESHOLD_SECONDS) {
            Self::Short
        } else {
            Self::Long
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long => "long",
        }
    }
}

impl std::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The metadata the source reports for a video, before it is classified and stored.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VideoMetadata {
    pub video_id: VideoId,
    pub channel_id: ChannelId,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub duration_seconds: u32,
    pub published_at: Timestamp,
}

/// A stored video.
///
/// The size class is assigned once from the duration when the video is first stored and is carried
/// over unchanged by [Video::corrected].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Video {
    pub video_id: VideoId,
    pub channel_id: ChannelId,
    pub title: String,
    pub description: String,
    pub tags: BTreeSet<String>,
    pub duration_seconds: u32,
    pub published_at: Timestamp,
    pub size_class: SizeClass,
    pub active: bool,
    pub discovered_at: Timestamp,
}

impl Video {
    pub fn from_metadata(metadata: VideoMetadata) -> Self {
        let size_class =
            SizeClass::from_duration(Duration::seconds(metadata.duration_seconds.into()));

        Self {
            video_id: metadata.video_id,
            channel_id: metadata.channel_id,
            title: metadata.title,
            description: metadata.description,
            tags: metadata.tags,
            duration_seconds: metadata.duration_seconds,
            published_at: metadata.published_at,
            size_class,
            active: true,
            discovered_at: now(),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_seconds.into())
    }

    /// Returns the corrected copy of this video if the source reports different editable metadata.
    ///
    /// Ownership, publish time and size class are never rewritten.
    pub fn corrected(&self, metadata: &VideoMetadata) -> Option<Video> {
        let unchanged = self.title == metadata.title
            && self.description == metadata.description
            && self.tags == metadata.tags;

        if unchanged {
            return None;
        }

        Some(Video {
            title: metadata.title.clone(),
            description: metadata.description.clone(),
            tags: metadata.tags.clone(),
            ..self.clone()
        })
    }
}

define_relation! {
    Video > create(id: VideoId, video: Video) > Vec<Video>
        where "CREATE type::thing('videos', $id) CONTENT $video"
}

define_relation! {
    Video > replace(id: VideoId, video: Video) > Vec<Video>
        where "UPDATE videos CONTENT $video WHERE video_id = $id RETURN AFTER"
}

define_relation! {
    Video > get(id: VideoId) > Option<Video>
        where "SELECT * FROM type::thing('videos', $id)"
}

define_relation! {
    Video > known_ids(channel: ChannelId) > Vec<VideoId>
        where "SELECT VALUE video_id FROM videos WHERE channel_id = $channel"
}

define_relation! {
    Video > by_channel(channel: ChannelId, active: bool) > Vec<Video>
        where "SELECT * FROM videos WHERE channel_id = $channel AND active = $active ORDER BY published_at"
}

define_relation! {
    Video > deactivate(id: VideoId) > Vec<Video>
        where "UPDATE videos SET active = false WHERE video_id = $id RETURN AFTER"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(duration_seconds: u32) -> VideoMetadata {
        VideoMetadata {
            video_id: "dQw4w9WgXcQ".parse().unwrap(),
            channel_id: "UCabc".parse().unwrap(),
            title: "ශ්‍රී ලංකා travel vlog".to_string(),
            description: String::new(),
            tags: BTreeSet::from(["travel".to_string()]),
            duration_seconds,
            published_at: Timestamp::parse("2024-03-01T10:00:00Z").unwrap(),
        }
    }

    #[test]
    fn size_class_threshold() {
        assert_eq!(SizeClass::from_duration(Duration::seconds(30)), SizeClass::Short);
        assert_eq!(SizeClass::from_duration(Duration::seconds(59)), SizeClass::Short);
        assert_eq!(SizeClass::from_duration(Duration::seconds(60)), SizeClass::Long);
        assert_eq!(SizeClass::from_duration(Duration::hours(2)), SizeClass::Long);
    }

    #[test]
    fn size_class_is_stable() {
        for seconds in [0, 1, 59, 60, 61, 3600] {
            let first = SizeClass::from_duration(Duration::seconds(seconds));
            let second = SizeClass::from_duration(Duration::seconds(seconds));
            assert_eq!(first, second);
        }
    }

    #[test]
    fn correction_keeps_size_class() {
        let video = Video::from_metadata(metadata(30));
        assert_eq!(video.size_class, SizeClass::Short);

        let mut updated = metadata(600);
        updated.title = "renamed".to_string();

        let corrected = video.corrected(&updated).expect("title changed");
        assert_eq!(corrected.title, "renamed");
        assert_eq!(corrected.size_class, SizeClass::Short);
        assert_eq!(corrected.duration_seconds, 30);
    }

    #[test]
    fn no_correction_when_metadata_matches() {
        let video = Video::from_metadata(metadata(300));
        assert_eq!(video.corrected(&metadata(300)), None);
    }
}
