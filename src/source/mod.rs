//! Access to the external video-metadata API.
//!
//! [Adapter] wraps a [VideoSource] with a pool of credentials, quota accounting, bounded retries
//! and per-call timeouts. Callers only ever see the final outcome of a request.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use derive_new::new;
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::instrument;

use crate::model::{Channel, ChannelId, Counters, VideoId, VideoMetadata};

pub use error::*;
pub use quota::QuotaLedger;
pub use youtube::{YouTubeApi, YouTubeConfig};

mod error;
mod quota;
mod youtube;

/// What to fetch from the source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Request {
    Channel(ChannelId),
    Video(VideoId),
    /// The most recent uploads of a channel.
    Uploads(ChannelId),
}

impl Request {
    /// Quota units one call costs.
    pub fn cost(&self) -> u32 {
        1
    }
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Channel(id) => write!(f, "channel `{id}`"),
            Request::Video(id) => write!(f, "video `{id}`"),
            Request::Uploads(id) => write!(f, "uploads of `{id}`"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    pub metadata: VideoMetadata,
    pub counters: Counters,
}

/// A validated record returned by the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Channel(Channel),
    Video(VideoRecord),
    Uploads(Vec<VideoId>),
}

impl RawRecord {
    fn kind(&self) -> &'static str {
        match self {
            RawRecord::Channel(_) => "channel",
            RawRecord::Video(_) => "video",
            RawRecord::Uploads(_) => "uploads",
        }
    }

    pub fn into_channel(self, request: &Request) -> Result<Channel> {
        let kind = self.kind();
        match self {
            RawRecord::Channel(channel) => Ok(channel),
            _ => unexpected(request, kind),
        }
    }

    pub fn into_video(self, request: &Request) -> Result<VideoRecord> {
        let kind = self.kind();
        match self {
            RawRecord::Video(video) => Ok(video),
            _ => unexpected(request, kind),
        }
    }

    pub fn into_uploads(self, request: &Request) -> Result<Vec<VideoId>> {
        let kind = self.kind();
        match self {
            RawRecord::Uploads(uploads) => Ok(uploads),
            _ => unexpected(request, kind),
        }
    }
}

fn unexpected<T>(request: &Request, kind: &str) -> Result<T> {
    MalformedSnafu {
        resource: request.to_string(),
        message: format!("source answered with a {kind} record"),
    }
    .fail()
}

/// One API key of the credential pool.
#[derive(Clone, new)]
pub struct Credential {
    pub slot: usize,
    key: String,
}

impl Credential {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// A raw connection to the external API. Implementations report failures using the
/// [SourceError] taxonomy and perform no retries of their own.
pub trait VideoSource: Send + Sync {
    fn fetch(
        &self, credential: &Credential, request: &Request,
    ) -> impl Future<Output = Result<RawRecord>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per credential, including the first one.
    pub attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of a single external call.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            timeout: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);

        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.attempts.saturating_sub(1))
    }
}

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct AdapterCounters {
    calls: Counter,
    retries: Counter,
    rotations: Counter,
    failures: Counter,
}

/// Point-in-time copy of the adapter's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AdapterStats {
    pub calls: u64,
    pub retries: u64,
    pub rotations: u64,
    pub failures: u64,
}

#[derive(Debug)]
pub struct Adapter<S> {
    source: S,
    credentials: Vec<Credential>,
    ledger: Arc<QuotaLedger>,
    policy: RetryPolicy,
    cursor: AtomicUsize,
    counters: AdapterCounters,
}

impl<S: VideoSource> Adapter<S> {
    /// Slot `i` of `ledger` accounts for the `i`-th key.
    pub fn new(source: S, keys: Vec<String>, ledger: Arc<QuotaLedger>, policy: RetryPolicy) -> Self {
        let credentials = keys
            .into_iter()
            .enumerate()
            .map(|(slot, key)| Credential::new(slot, key))
            .collect();

        Self {
            source,
            credentials,
            ledger,
            policy,
            cursor: AtomicUsize::new(0),
            counters: AdapterCounters::default(),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        AdapterStats {
            calls: self.counters.calls.get(),
            retries: self.counters.retries.get(),
            rotations: self.counters.rotations.get(),
            failures: self.counters.failures.get(),
        }
    }

    /// Fetch a record, rotating through credential slots on quota exhaustion.
    ///
    /// `QuotaExceeded` only reaches the caller once every slot is spent for the current cycle.
    #[instrument(skip(self, request), fields(%request))]
    pub async fn fetch(&self, request: Request) -> Result<RawRecord> {
        let slots = self.credentials.len();
        let start = self.cursor.load(Ordering::Relaxed);

        for step in 0..slots {
            let slot = (start + step) % slots;
            let credential = &self.credentials[slot];

            match self.fetch_with_retry(credential, &request).await {
                Err(error) if error.is_quota() => {
                    tracing::warn!(slot, %error, "credential slot exhausted, rotating");
                    self.ledger.exhaust(slot);
                    self.counters.rotations.incr();
                    self.cursor.store((slot + 1) % slots, Ordering::Relaxed);
                }
                Err(error) => {
                    self.counters.failures.incr();
                    return Err(error);
                }
                Ok(record) => return Ok(record),
            }
        }

        self.counters.failures.incr();
        QuotaExceededSnafu {
            message: format!("all {slots} credential slots are exhausted"),
        }
        .fail()
    }

    async fn fetch_with_retry(&self, credential: &Credential, request: &Request) -> Result<RawRecord> {
        RetryIf::start(
            self.policy.backoff(),
            || self.attempt(credential, request),
            |error: &SourceError| {
                let retry = error.is_transient();
                if retry {
                    tracing::debug!(slot = credential.slot, %error, "retrying transient failure");
                    self.counters.retries.incr();
                }
                retry
            },
        )
        .await
    }

    async fn attempt(&self, credential: &Credential, request: &Request) -> Result<RawRecord> {
        if !self.ledger.try_spend(credential.slot, request.cost()) {
            return QuotaExceededSnafu {
                message: format!("slot {} has no quota left this cycle", credential.slot),
            }
            .fail();
        }

        self.counters.calls.incr();

        let call = self.source.fetch(credential, request);
        match tokio::time::timeout(self.policy.timeout, call).await {
            Ok(result) => result,
            Err(_) => TransientSnafu {
                resource: request.to_string(),
                message: format!("no answer within {:?}", self.policy.timeout),
            }
            .fail(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn uploads(channel: &str) -> Request {
        Request::Uploads(channel.parse().unwrap())
    }

    fn some_uploads() -> Scripted {
        Scripted::Record(RawRecord::Uploads(vec!["dQw4w9WgXcQ".parse().unwrap()]))
    }

    #[tokio::test]
    async fn rotates_to_next_slot_when_quota_runs_out() {
        let source = FakeSource::default();
        source.script(uploads("UCa"), vec![some_uploads()]);

        // slot A allows two calls, slot B two more
        let adapter = adapter(source, &["key-a", "key-b"], 2);

        for _ in 0..4 {
            let record = adapter.fetch(uploads("UCa")).await;
            assert!(record.is_ok(), "caller must not see the rotation: {record:?}");
        }

        let slots: Vec<usize> = adapter.source.calls().iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![0, 0, 1, 1]);

        let error = adapter.fetch(uploads("UCa")).await.unwrap_err();
        assert!(error.is_quota(), "all slots spent: {error}");
        assert_eq!(adapter.stats().failures, 1);
    }

    #[tokio::test]
    async fn rotates_when_the_source_reports_quota_exceeded() {
        let source = FakeSource::default();
        source.script(uploads("UCa"), vec![some_uploads()]);
        source.exhaust_key("key-a");

        let adapter = adapter(source, &["key-a", "key-b"], 100);

        assert!(adapter.fetch(uploads("UCa")).await.is_ok());
        assert_eq!(adapter.stats().rotations, 1);

        // the cursor stays on the working slot
        assert!(adapter.fetch(uploads("UCa")).await.is_ok());
        let slots: Vec<usize> = adapter.source.calls().iter().map(|(slot, _)| *slot).collect();
        assert_eq!(slots, vec![0, 1, 1]);
    }

    #[tokio::test]
    async fn surfaces_quota_exceeded_when_every_slot_is_spent() {
        let source = FakeSource::default();
        source.exhaust_key("key-a");
        source.exhaust_key("key-b");

        let adapter = adapter(source, &["key-a", "key-b"], 100);

        let error = adapter.fetch(uploads("UCa")).await.unwrap_err();
        assert!(error.is_quota());
        assert_eq!(adapter.stats().rotations, 2);
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let source = FakeSource::default();
        source.script(
            uploads("UCa"),
            vec![Scripted::Transient, Scripted::Transient, some_uploads()],
        );

        let adapter = adapter(source, &["key-a"], 100);

        assert!(adapter.fetch(uploads("UCa")).await.is_ok());
        assert_eq!(adapter.stats().retries, 2);
        assert_eq!(adapter.stats().calls, 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempt_ceiling() {
        let source = FakeSource::default();
        source.script(uploads("UCa"), vec![Scripted::Transient]);

        let adapter = adapter(source, &["key-a"], 100);

        let error = adapter.fetch(uploads("UCa")).await.unwrap_err();
        assert!(error.is_transient());
        assert_eq!(adapter.stats().calls, 3, "attempt ceiling is 3");
        assert_eq!(adapter.stats().failures, 1);
    }

    #[tokio::test]
    async fn hung_call_is_a_transient_failure() {
        let source = FakeSource::default();
        source.script(uploads("UCa"), vec![Scripted::Hang, some_uploads()]);

        let adapter = adapter(source, &["key-a"], 100);

        assert!(adapter.fetch(uploads("UCa")).await.is_ok());
        assert_eq!(adapter.stats().retries, 1);
    }

    #[tokio::test]
    async fn not_found_is_not_retried() {
        let source = FakeSource::default();
        let adapter = adapter(source, &["key-a"], 100);

        let error = adapter.fetch(uploads("UCa")).await.unwrap_err();
        assert!(error.is_not_found());
        assert_eq!(adapter.stats().calls, 1);
    }

    #[test]
    fn record_kind_mismatch_is_malformed() {
        let request = uploads("UCa");
        let error = RawRecord::Uploads(vec![]).into_channel(&request).unwrap_err();
        assert!(matches!(error, SourceError::Malformed { .. }));
    }
}
