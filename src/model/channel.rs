use snafu::{ensure, Snafu};

use super::*;

/// A YouTube channel id (`UC...`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId(String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for ChannelId {
    type Err = ParseChannelId;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        ensure!(
            !text.is_empty() && !text.contains(char::is_whitespace),
            ParseChannelIdSnafu { text }
        );

        Ok(Self(text.to_string()))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ParseChannelId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(value: ChannelId) -> Self {
        value.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("`{text}` is not a valid channel id"))]
pub struct ParseChannelId {
    pub text: String,
}

/// A channel as last seen by the ingestion pipeline. Channels are never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, new)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub title: String,
    pub description: String,
    pub country: Option<String>,
    pub subscribers: u64,
    /// Public uploads as reported by the source, not just the ones ingested so far.
    #[serde(default)]
    pub video_count: u64,
    pub created_at: Timestamp,
    #[new(value = "true")]
    pub active: bool,
    #[new(value = "now()")]
    pub updated_at: Timestamp,
}

define_relation! {
    Channel > upsert(id: ChannelId, channel: Channel) > Vec<Channel>
        where "UPDATE type::thing('channels', $id) CONTENT $channel RETURN AFTER"
}

define_relation! {
    Channel > get(id: ChannelId) > Option<Channel>
        where "SELECT * FROM type::thing('channels', $id)"
}

define_relation! {
    Channel > find(active: bool) > Vec<Channel>
        where "SELECT * FROM channels WHERE active = $active ORDER BY channel_id"
}

define_relation! {
    Channel > deactivate(id: ChannelId) > Vec<Channel>
        where "UPDATE channels SET active = false WHERE channel_id = $id RETURN AFTER"
}
