use chrono::{Datelike, Duration, FixedOffset, Timelike};
use derive_new::new;
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

pub fn now() -> Timestamp {
    chrono::Utc::now().into()
}

/// A UTC instant, serialized as RFC 3339 so that it survives the round trip through the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, new)]
pub struct Timestamp(chrono::DateTime<chrono::Utc>);

impl Timestamp {
    pub fn inner(self) -> chrono::DateTime<chrono::Utc> {
        self.0
    }

    /// Hour of day (0-23) and weekday (0 = Monday) as seen from the given offset.
    pub fn local_hour_and_weekday(self, offset: FixedOffset) -> (u32, u32) {
        let local = self.0.with_timezone(&offset);
        (local.hour(), local.weekday().num_days_from_monday())
    }

    pub fn parse(text: &str) -> Result<Self, chrono::ParseError> {
        chrono::DateTime::parse_from_rfc3339(text).map(|dt| Self(dt.into()))
    }
}

impl From<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }
}

impl AsRef<chrono::DateTime<chrono::Utc>> for Timestamp {
    fn as_ref(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.to_rfc3339().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self(self.0 - rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_rfc3339() {
        let timestamp = Timestamp::parse("2024-03-01T10:15:00Z").unwrap();
        let json = serde_json::to_string(&timestamp).unwrap();
        assert_eq!(json, "\"2024-03-01T10:15:00+00:00\"");

        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, timestamp);
    }

    #[test]
    fn local_hour_follows_offset() {
        // 20:00 UTC on a Sunday is 01:30 on Monday in Colombo
        let timestamp = Timestamp::parse("2024-03-03T20:00:00Z").unwrap();
        let colombo = FixedOffset::east_opt(5 * 3600 + 1800).unwrap();

        assert_eq!(timestamp.local_hour_and_weekday(colombo), (1, 0));
    }
}
