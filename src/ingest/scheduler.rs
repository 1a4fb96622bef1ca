use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snafu::ResultExt as _;

use super::*;
use crate::time;

/// Background task running [Pipeline::run] at `start_at + k * interval` and sweeping expired
/// forecasts from the cache in between.
#[derive(Debug)]
pub struct Scheduler {
    tx: mpsc::Sender<Message>,
    task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Message {
    Stop,
}

impl Scheduler {
    pub fn spawn<S>(pipeline: Arc<Pipeline<S>>, cache: Arc<ResultCache>) -> Self
    where
        S: VideoSource + 'static,
    {
        let (tx, mut message) = mpsc::channel(1);

        let task = tokio::spawn(async move {
            let config = pipeline.config();
            let mut runs = time::timer(config.start_at, *config.interval);
            let mut sweeps = time::timer(now(), *config.cache_sweep);

            tracing::info!(
                interval = %config.interval,
                start_at = %config.start_at,
                "ingestion scheduled"
            );

            loop {
                select! {
                    _ = runs.tick() => {
                        let seeds = match seeds(&pipeline).await {
                            Ok(seeds) => seeds,
                            Err(error) => {
                                tracing::error!(%error, "cannot load the channels to ingest");
                                continue;
                            }
                        };

                        // Stop drops the run in progress.
                        select! {
                            outcome = pipeline.run(seeds) => if let Err(error) = outcome {
                                tracing::error!(%error, "ingestion run failed");
                            },
                            Some(msg) = message.recv() => match msg {
                                Message::Stop => {
                                    tracing::warn!("ingestion run cancelled");
                                    break;
                                }
                            }
                        }
                    },
                    _ = sweeps.tick() => {
                        cache.purge_expired(now());
                    },
                    Some(msg) = message.recv() => match msg {
                        Message::Stop => break,
                    }
                }
            }

            tracing::info!("ingestion scheduler stopped");
        });

        Self { tx, task }
    }

    /// Stop the task, cancelling the current run if there is one.
    pub async fn stop(self) {
        self.tx.send(Message::Stop).await.ok();
        if let Err(error) = self.task.await {
            tracing::error!(%error, "ingestion scheduler panicked");
        }
    }
}

/// The configured seeds plus every channel still active in the database.
async fn seeds<S: VideoSource>(pipeline: &Pipeline<S>) -> Result<Vec<ChannelId>> {
    let known = Channel::find(true, pipeline.database())
        .await
        .context(DatabaseSnafu)?;

    let seeds: BTreeSet<ChannelId> = pipeline
        .config()
        .seeds
        .iter()
        .cloned()
        .chain(known.into_iter().map(|channel| channel.channel_id))
        .collect();

    Ok(seeds.into_iter().collect())
}
