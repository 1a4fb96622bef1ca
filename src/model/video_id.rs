use snafu::{OptionExt as _, Snafu};

use super::*;

/// An 11 character YouTube video id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VideoId(String);

impl VideoId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(text: &str) -> Result<Self, ParseVideoId> {
        let valid = text.len() == 11
            && text
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

        if !valid {
            return InvalidIdSnafu { text }.fail();
        }

        Ok(Self(text.to_string()))
    }
}

/// Accepts either a bare id or a `youtube.com/watch?v=` / `youtu.be/` link.
impl std::str::FromStr for VideoId {
    type Err = ParseVideoId;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        // if text is not a url, treat the text as the id
        let Ok(url) = url::Url::parse(text) else {
            return Self::validate(text);
        };

        match url.host_str() {
            Some("youtu.be") => {
                let id = url
                    .path_segments()
                    .and_then(|mut segments| segments.next())
                    .filter(|segment| !segment.is_empty())
                    .context(MissingIdFragmentSnafu { text })?;
                Self::validate(id)
            }
            Some("www.youtube.com" | "youtube.com" | "m.youtube.com") => {
                let id = url
                    .query_pairs()
                    .find_map(|(key, value)| (key == "v").then_some(value))
                    .context(MissingIdFragmentSnafu { text })?;
                Self::validate(&id)
            }
            _ => ExpectYouTubeUrlSnafu { text }.fail(),
        }
    }
}

impl TryFrom<String> for VideoId {
    type Error = ParseVideoId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VideoId> for String {
    fn from(value: VideoId) -> Self {
        value.0
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VideoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ParseVideoId {
    /// text is a valid url, but it's missing the id fragment
    #[snafu(display("`{text}` is missing the video id"))]
    MissingIdFragment { text: String },

    /// text is a url, but it doesn't point to youtube
    #[snafu(display("`{text}` is not a youtube url"))]
    ExpectYouTubeUrl { text: String },

    #[snafu(display("`{text}` is not a valid video id"))]
    InvalidId { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<String, ParseVideoId> {
        text.parse::<VideoId>().map(String::from)
    }

    #[test]
    fn parse_youtube_url() {
        let result = parse("https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert_eq!(result.as_deref(), Ok("dQw4w9WgXcQ"));
    }

    #[test]
    fn parse_youtube_url_with_other_queries() {
        let result =
            parse("https://www.youtube.com/watch?list=some-playlist&v=dQw4w9WgXcQ&feature=emb_logo");
        assert_eq!(result.as_deref(), Ok("dQw4w9WgXcQ"));
    }

    #[test]
    fn parse_youtube_short_url() {
        let result = parse("https://youtu.be/dQw4w9WgXcQ?t=1");
        assert_eq!(result.as_deref(), Ok("dQw4w9WgXcQ"));
    }

    #[test]
    fn parse_non_url_id() {
        let result = parse("a_b-C1d2E3f");
        assert_eq!(result.as_deref(), Ok("a_b-C1d2E3f"));
    }

    #[test]
    fn throw_error_on_missing_fragment() {
        let result = parse("https://www.youtube.com/watch");
        assert_eq!(
            result,
            Err(ParseVideoId::MissingIdFragment {
                text: "https://www.youtube.com/watch".to_string()
            })
        );
    }

    #[test]
    fn throw_error_on_non_youtube_url() {
        let result = parse("https://www.google.com");
        assert_eq!(
            result,
            Err(ParseVideoId::ExpectYouTubeUrl {
                text: "https://www.google.com".to_string()
            })
        );
    }

    #[test]
    fn throw_error_on_malformed_id() {
        assert!(matches!(parse("short"), Err(ParseVideoId::InvalidId { .. })));
        assert!(serde_json::from_str::<VideoId>("\"has spaces!\"").is_err());
    }
}
