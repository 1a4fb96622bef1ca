use snafu::ensure;

use crate::database::{Database, NoResultsSnafu, OutOfOrderSnapshotSnafu, Result};

use super::*;

/// Position of a snapshot in its video's history, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct SnapshotId(pub u64);

impl SnapshotId {
    pub const FIRST: SnapshotId = SnapshotId(1);

    pub fn next(self) -> SnapshotId {
        SnapshotId(self.0 + 1)
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Counters reported by the source at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, new)]
pub struct Counters {
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
}

/// One immutable point of a video's view-count history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Snapshot {
    pub video_id: VideoId,
    pub seq: SnapshotId,
    pub captured_at: Timestamp,
    pub views: u64,
    pub likes: u64,
    pub comments: u64,
}

impl Snapshot {
    pub fn counters(&self) -> Counters {
        Counters::new(self.views, self.likes, self.comments)
    }

    /// Append a snapshot to the video's history.
    ///
    /// Appends for one video are serialized, and a capture time that is not strictly after the
    /// latest stored snapshot is rejected without touching the history.
    #[tracing::instrument(skip(db))]
    pub async fn append(
        video_id: &VideoId, captured_at: Timestamp, counters: Counters, db: &Database,
    ) -> Result<Snapshot> {
        let lock = db.append_lock(video_id);
        let _guard = lock.lock().await;

        let latest = Snapshot::latest(video_id.clone(), db).await?;

        let seq = match latest {
            Some(latest) => {
                ensure!(
                    captured_at > latest.captured_at,
                    OutOfOrderSnapshotSnafu {
                        video_id: video_id.clone(),
                        captured_at,
                        latest: latest.captured_at,
                    }
                );
                latest.seq.next()
            }
            None => SnapshotId::FIRST,
        };

        let snapshot = Snapshot {
            video_id: video_id.clone(),
            seq,
            captured_at,
            views: counters.views,
            likes: counters.likes,
            comments: counters.comments,
        };

        let created: Vec<Snapshot> = db
            .sql("CREATE snapshots CONTENT $snapshot")
            .bind(("snapshot", snapshot.clone()))
            .fetch_first()
            .await?;

        ensure!(!created.is_empty(), NoResultsSnafu);
        tracing::debug!(video.id = %video_id, snapshot.seq = %seq, "appended snapshot");

        Ok(snapshot)
    }
}

define_relation! {
    Snapshot > history(video: VideoId) > Vec<Snapshot>
        where "SELECT * FROM snapshots WHERE video_id = $video ORDER BY seq ASC"
}

define_relation! {
    Snapshot > latest(video: VideoId) > Option<Snapshot>
        where "SELECT * FROM snapshots WHERE video_id = $video ORDER BY seq DESC LIMIT 1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseError;

    fn video_id() -> VideoId {
        "dQw4w9WgXcQ".parse().unwrap()
    }

    fn at(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    #[tokio::test]
    async fn appends_in_order() {
        let db = Database::memory().await.unwrap();
        let video = video_id();

        let first = Snapshot::append(&video, at("2024-03-01T10:00:00Z"), Counters::new(0, 0, 0), &db)
            .await
            .unwrap();
        let second =
            Snapshot::append(&video, at("2024-03-01T11:00:00Z"), Counters::new(1000, 10, 2), &db)
                .await
                .unwrap();

        assert_eq!(first.seq, SnapshotId(1));
        assert_eq!(second.seq, SnapshotId(2));

        let history = Snapshot::history(video, &db).await.unwrap();
        assert_eq!(history, vec![first, second]);
    }

    #[tokio::test]
    async fn rejects_out_of_order_capture() {
        let db = Database::memory().await.unwrap();
        let video = video_id();

        Snapshot::append(&video, at("2024-03-01T11:00:00Z"), Counters::new(10, 0, 0), &db)
            .await
            .unwrap();

        let earlier =
            Snapshot::append(&video, at("2024-03-01T10:00:00Z"), Counters::new(5, 0, 0), &db).await;
        assert!(matches!(earlier, Err(DatabaseError::OutOfOrderSnapshot { .. })));

        let same =
            Snapshot::append(&video, at("2024-03-01T11:00:00Z"), Counters::new(5, 0, 0), &db).await;
        assert!(matches!(same, Err(DatabaseError::OutOfOrderSnapshot { .. })));

        let history = Snapshot::history(video, &db).await.unwrap();
        assert_eq!(history.len(), 1, "history must be left untouched");
        assert_eq!(history[0].views, 10);
    }
}
