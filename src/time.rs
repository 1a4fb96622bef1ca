use std::time::Duration;

use tracing::instrument;

use crate::model::{now, Timestamp};

/// A ticker that fires at `start + k * period`. If `start` already passed, the first tick waits
/// for the next such instant instead of firing immediately.
#[instrument]
pub fn timer(start: Timestamp, period: Duration) -> tokio::time::Interval {
    let start = tokio::time::Instant::now() + duration_to_next_instant(start, period, now());

    let mut timer = tokio::time::interval_at(start, period);
    timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    timer
}

/// compute the time until the next "interval instant" will occur.
/// this is used to construct [tokio::time::Interval] on an interval that has already started.
fn duration_to_next_instant(start: Timestamp, period: Duration, now: Timestamp) -> Duration {
    if start > now {
        return (start - now).to_std().unwrap_or_default();
    }

    let period = period.as_secs().max(1) as i64;
    let elapsed = (now - start).num_seconds();
    let seconds_left = (period - elapsed % period) % period;

    Duration::from_secs(seconds_left as u64)
}

/// The start of the cycle containing `now`, for cycles of `period` anchored at `anchor`.
///
/// Quota counters reset whenever this value changes.
pub fn cycle_start(anchor: Timestamp, period: Duration, now: Timestamp) -> Timestamp {
    let period = chrono::Duration::seconds(period.as_secs().max(1) as i64);
    let elapsed = (now - anchor).num_seconds();
    let cycles = elapsed.div_euclid(period.num_seconds());

    anchor + period * cycles as i32
}
