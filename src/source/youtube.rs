//! [VideoSource] backed by the YouTube Data API v3.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use snafu::OptionExt as _;
use url::Url;

use super::*;
use crate::model::Timestamp;

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct YouTubeConfig {
    /// One credential slot per key. Comma separated in the environment.
    pub api_keys: Vec<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: Url,
    /// Quota units available to each key per cycle.
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    /// Any instant at which the quota resets; later resets happen every 24 hours after it.
    #[serde(default = "default_reset_anchor")]
    pub quota_reset_anchor: Timestamp,
    #[serde(default = "default_page_size")]
    pub uploads_page_size: u32,
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_base_delay")]
    pub retry_delay: humantime::Duration,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default = "default_timeout")]
    pub timeout: humantime::Duration,
}

fn default_endpoint() -> Url {
    Url::parse("https://www.googleapis.com/youtube/v3/").expect("static url is valid")
}

fn default_daily_quota() -> u32 {
    10_000
}

// midnight Pacific time
fn default_reset_anchor() -> Timestamp {
    Timestamp::parse("2024-01-01T08:00:00Z").expect("static timestamp is valid")
}

fn default_page_size() -> u32 {
    50
}

fn default_attempts() -> usize {
    RetryPolicy::default().attempts
}

fn default_base_delay() -> humantime::Duration {
    RetryPolicy::default().base_delay.into()
}

fn default_timeout() -> humantime::Duration {
    RetryPolicy::default().timeout.into()
}

impl YouTubeConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts.max(1),
            base_delay: *self.retry_delay,
            timeout: *self.timeout,
            ..RetryPolicy::default()
        }
    }

    pub fn ledger(&self) -> QuotaLedger {
        QuotaLedger::daily(self.api_keys.len(), self.daily_quota, self.quota_reset_anchor)
    }
}

#[derive(Debug, Clone)]
pub struct YouTubeApi {
    http: reqwest::Client,
    endpoint: Url,
    page_size: u32,
}

impl YouTubeApi {
    pub fn new(config: &YouTubeConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.endpoint.clone(),
            page_size: config.uploads_page_size.clamp(1, 50),
        }
    }

    async fn get<T: DeserializeOwned>(
        &self, path: &str, query: &[(&str, String)], credential: &Credential, request: &Request,
    ) -> Result<T> {
        let resource = request.to_string();

        let url = self.endpoint.join(path).ok().context(MalformedSnafu {
            resource: resource.clone(),
            message: format!("cannot join `{path}` onto the endpoint"),
        })?;

        tracing::debug!(%url, slot = credential.slot, "requesting {resource}");

        let response = self
            .http
            .get(url)
            .query(query)
            .query(&[("key", credential.key())])
            .send()
            .await
            .map_err(|error| {
                TransientSnafu {
                    resource: resource.clone(),
                    message: error.to_string(),
                }
                .build()
            })?;

        let status = response.status();
        if status.is_success() {
            let body = response.text().await.map_err(|error| {
                TransientSnafu {
                    resource: resource.clone(),
                    message: error.to_string(),
                }
                .build()
            })?;

            return serde_json::from_str(&body).map_err(|error| {
                MalformedSnafu {
                    resource,
                    message: error.to_string(),
                }
                .build()
            });
        }

        let body = response.json::<ErrorEnvelope>().await.unwrap_or_default();
        Err(classify(status.as_u16(), body, resource))
    }
}

impl VideoSource for YouTubeApi {
    async fn fetch(&self, credential: &Credential, request: &Request) -> Result<RawRecord> {
        match request {
            Request::Channel(id) => {
                let query = [
                    ("part", "snippet,statistics".to_string()),
                    ("id", id.to_string()),
                ];
                let body: ListResponse<ChannelItem> =
                    self.get("channels", &query, credential, request).await?;
                parse_channel(body, request).map(RawRecord::Channel)
            }
            Request::Video(id) => {
                let query = [
                    ("part", "snippet,statistics,contentDetails".to_string()),
                    ("id", id.to_string()),
                ];
                let body: ListResponse<VideoItem> =
                    self.get("videos", &query, credential, request).await?;
                parse_video(body, request).map(RawRecord::Video)
            }
            Request::Uploads(id) => {
                let query = [
                    ("part", "contentDetails".to_string()),
                    ("playlistId", uploads_playlist(id)),
                    ("maxResults", self.page_size.to_string()),
                ];
                let body: ListResponse<PlaylistItem> =
                    self.get("playlistItems", &query, credential, request).await?;
                parse_uploads(body, request).map(RawRecord::Uploads)
            }
        }
    }
}

/// Every channel's uploads live in a playlist whose id swaps the `UC` prefix for `UU`.
fn uploads_playlist(channel: &ChannelId) -> String {
    match channel.as_str().strip_prefix("UC") {
        Some(rest) => format!("UU{rest}"),
        None => channel.to_string(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    error: ErrorBody,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorReason>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorReason {
    #[serde(default)]
    reason: String,
}

fn classify(status: u16, body: ErrorEnvelope, resource: String) -> SourceError {
    let reasons: Vec<&str> = body.error.errors.iter().map(|e| e.reason.as_str()).collect();
    let message = body.error.message.clone();

    let quota = reasons
        .iter()
        .any(|reason| matches!(*reason, "quotaExceeded" | "dailyLimitExceeded"));

    match status {
        403 if quota => QuotaExceededSnafu { message }.build(),
        404 => NotFoundSnafu { resource }.build(),
        403 if reasons.contains(&"rateLimitExceeded") => TransientSnafu { resource, message }.build(),
        408 | 429 | 500..=599 => TransientSnafu { resource, message }.build(),
        _ => RejectedSnafu {
            resource,
            status,
            message,
        }
        .build(),
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelItem {
    id: String,
    snippet: Option<ChannelSnippet>,
    statistics: Option<ChannelStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelSnippet {
    title: Option<String>,
    #[serde(default)]
    description: String,
    country: Option<String>,
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelStatistics {
    subscriber_count: Option<String>,
    #[serde(default)]
    hidden_subscriber_count: bool,
    video_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    snippet: Option<VideoSnippet>,
    content_details: Option<VideoContentDetails>,
    statistics: Option<VideoStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoSnippet {
    channel_id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    tags: Vec<String>,
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoStatistics {
    view_count: Option<String>,
    like_count: Option<String>,
    comment_count: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    content_details: Option<PlaylistItemContentDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemContentDetails {
    video_id: Option<String>,
}

/// Builds a [SourceError::Malformed] for missing or unparseable fields.
struct Validator<'a> {
    request: &'a Request,
}

impl Validator<'_> {
    fn malformed(&self, message: impl Into<String>) -> SourceError {
        MalformedSnafu {
            resource: self.request.to_string(),
            message,
        }
        .build()
    }

    fn required<T>(&self, value: Option<T>, field: &str) -> Result<T> {
        value.ok_or_else(|| self.malformed(format!("missing `{field}`")))
    }

    fn count(&self, value: Option<String>, field: &str) -> Result<u64> {
        let text = self.required(value, field)?;
        text.parse()
            .map_err(|_| self.malformed(format!("`{field}` is not a count: {text}")))
    }

    fn timestamp(&self, value: Option<String>, field: &str) -> Result<Timestamp> {
        let text = self.required(value, field)?;
        Timestamp::parse(&text)
            .map_err(|error| self.malformed(format!("`{field}` is not a timestamp: {error}")))
    }
}

fn single<T>(body: ListResponse<T>, request: &Request) -> Result<T> {
    body.items.into_iter().next().context(NotFoundSnafu {
        resource: request.to_string(),
    })
}

fn parse_channel(body: ListResponse<ChannelItem>, request: &Request) -> Result<Channel> {
    let check = Validator { request };
    let item = single(body, request)?;

    let channel_id: ChannelId = item
        .id
        .parse()
        .map_err(|_| check.malformed("channel id is empty"))?;
    let snippet = check.required(item.snippet, "snippet")?;
    let statistics = check.required(item.statistics, "statistics")?;

    let subscribers = if statistics.hidden_subscriber_count {
        0
    } else {
        check.count(statistics.subscriber_count, "statistics.subscriberCount")?
    };
    let video_count = check.count(statistics.video_count, "statistics.videoCount")?;

    Ok(Channel::new(
        channel_id,
        check.required(snippet.title, "snippet.title")?,
        snippet.description,
        snippet.country,
        subscribers,
        video_count,
        check.timestamp(snippet.published_at, "snippet.publishedAt")?,
    ))
}

fn parse_video(body: ListResponse<VideoItem>, request: &Request) -> Result<VideoRecord> {
    let check = Validator { request };
    let item = single(body, request)?;

    let video_id: VideoId = item
        .id
        .parse()
        .map_err(|error: crate::model::ParseVideoId| check.malformed(error.to_string()))?;
    let snippet = check.required(item.snippet, "snippet")?;
    let details = check.required(item.content_details, "contentDetails")?;
    let statistics = check.required(item.statistics, "statistics")?;

    let channel_id: ChannelId = check
        .required(snippet.channel_id, "snippet.channelId")?
        .parse()
        .map_err(|_| check.malformed("`snippet.channelId` is empty"))?;

    let duration = check.required(details.duration, "contentDetails.duration")?;
    let duration_seconds = parse_iso8601_duration(&duration)
        .ok_or_else(|| check.malformed(format!("`{duration}` is not an ISO 8601 duration")))?;

    let metadata = VideoMetadata {
        video_id,
        channel_id,
        title: check.required(snippet.title, "snippet.title")?,
        description: snippet.description,
        tags: snippet.tags.into_iter().collect::<BTreeSet<_>>(),
        duration_seconds,
        published_at: check.timestamp(snippet.published_at, "snippet.publishedAt")?,
    };

    // likes and comments may be hidden or disabled by the uploader
    let counters = Counters {
        views: check.count(statistics.view_count, "statistics.viewCount")?,
        likes: statistics
            .like_count
            .map(|likes| check.count(Some(likes), "statistics.likeCount"))
            .transpose()?
            .unwrap_or(0),
        comments: statistics
            .comment_count
            .map(|comments| check.count(Some(comments), "statistics.commentCount"))
            .transpose()?
            .unwrap_or(0),
    };

    Ok(VideoRecord { metadata, counters })
}

fn parse_uploads(body: ListResponse<PlaylistItem>, request: &Request) -> Result<Vec<VideoId>> {
    let check = Validator { request };

    body.items
        .into_iter()
        .map(|item| {
            let id = item
                .content_details
                .and_then(|details| details.video_id)
                .ok_or_else(|| check.malformed("playlist item without `contentDetails.videoId`"))?;
            id.parse()
                .map_err(|error: crate::model::ParseVideoId| check.malformed(error.to_string()))
        })
        .collect()
}

/// Parses the `P#DT#H#M#S` durations the API reports, e.g. `PT1M30S`. Week and
/// year/month designators are not used by the API and are rejected.
pub fn parse_iso8601_duration(text: &str) -> Option<u32> {
    let rest = text.strip_prefix('P')?;
    let (days, time) = match rest.split_once('T') {
        Some((days, time)) => (days, Some(time)),
        None => (rest, None),
    };

    let mut total: u64 = 0;

    if !days.is_empty() {
        let count: u64 = days.strip_suffix('D')?.parse().ok()?;
        total = count.checked_mul(86_400)?;
    }

    if let Some(time) = time {
        if time.is_empty() {
            return None;
        }

        let mut number = String::new();
        for c in time.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }

            let value: u64 = number.parse().ok()?;
            number.clear();

            let seconds = match c {
                'H' => value.checked_mul(3600)?,
                'M' => value.checked_mul(60)?,
                'S' => value,
                _ => return None,
            };
            total = total.checked_add(seconds)?;
        }

        if !number.is_empty() {
            return None;
        }
    }

    u32::try_from(total).ok()
}
