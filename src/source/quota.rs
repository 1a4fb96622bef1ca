use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::model::{now, Timestamp};
use crate::time::cycle_start;

#[derive(Debug, Clone, Copy)]
struct SlotUsage {
    cycle: Option<Timestamp>,
    spent: u32,
}

impl SlotUsage {
    fn is_stale(&self, cycle: Timestamp) -> bool {
        self.cycle.map_or(true, |current| current < cycle)
    }
}

/// Per-credential quota counters shared by every worker using the adapter.
///
/// All slots live behind one lock, so a spend is a single check-and-decrement. Counters reset
/// when the wall clock crosses into a new cycle (`anchor + k * period`).
#[derive(Debug)]
pub struct QuotaLedger {
    limit: u32,
    anchor: Timestamp,
    period: Duration,
    slots: Mutex<Vec<SlotUsage>>,
}

impl QuotaLedger {
    pub fn new(slots: usize, limit: u32, anchor: Timestamp, period: Duration) -> Self {
        let usage = vec![SlotUsage { cycle: None, spent: 0 }; slots];

        Self {
            limit,
            anchor,
            period,
            slots: Mutex::new(usage),
        }
    }

    pub fn daily(slots: usize, limit: u32, anchor: Timestamp) -> Self {
        Self::new(slots, limit, anchor, Duration::from_secs(24 * 60 * 60))
    }

    pub fn slots(&self) -> usize {
        self.lock().len()
    }

    /// Spend `cost` units from `slot`. Returns `false`, spending nothing, when the slot does not have
    /// enough quota left in the current cycle or does not exist.
    pub fn try_spend(&self, slot: usize, cost: u32) -> bool {
        self.try_spend_at(slot, cost, now())
    }

    pub fn try_spend_at(&self, slot: usize, cost: u32, now: Timestamp) -> bool {
        let cycle = cycle_start(self.anchor, self.period, now);
        let mut slots = self.lock();

        let Some(usage) = slots.get_mut(slot) else {
            return false;
        };

        if usage.is_stale(cycle) {
            if usage.cycle.is_some() {
                tracing::info!(slot, %cycle, "quota cycle rolled over, resetting counter");
            }
            *usage = SlotUsage {
                cycle: Some(cycle),
                spent: 0,
            };
        }

        match usage.spent.checked_add(cost) {
            Some(spent) if spent <= self.limit => {
                usage.spent = spent;
                true
            }
            _ => false,
        }
    }

    /// Mark the slot as spent for the rest of the current cycle, e.g. after the source itself
    /// reported the quota as exceeded.
    pub fn exhaust(&self, slot: usize) {
        self.exhaust_at(slot, now())
    }

    pub fn exhaust_at(&self, slot: usize, now: Timestamp) {
        let cycle = cycle_start(self.anchor, self.period, now);
        let limit = self.limit;

        if let Some(usage) = self.lock().get_mut(slot) {
            *usage = SlotUsage {
                cycle: Some(cycle),
                spent: limit,
            };
        }
    }

    /// Units left in `slot` for the current cycle.
    pub fn remaining(&self, slot: usize) -> Option<u32> {
        self.remaining_at(slot, now())
    }

    pub fn remaining_at(&self, slot: usize, now: Timestamp) -> Option<u32> {
        let cycle = cycle_start(self.anchor, self.period, now);

        self.lock().get(slot).map(|usage| {
            if usage.is_stale(cycle) {
                self.limit
            } else {
                self.limit.saturating_sub(usage.spent)
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SlotUsage>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Duration as ChronoDuration;

    fn at(text: &str) -> Timestamp {
        Timestamp::parse(text).unwrap()
    }

    fn ledger(slots: usize, limit: u32) -> QuotaLedger {
        QuotaLedger::daily(slots, limit, at("2024-01-01T08:00:00Z"))
    }

    #[test]
    fn spends_until_limit() {
        let ledger = ledger(1, 3);
        let now = at("2024-03-05T09:00:00Z");

        assert!(ledger.try_spend_at(0, 1, now));
        assert!(ledger.try_spend_at(0, 2, now));
        assert!(!ledger.try_spend_at(0, 1, now), "limit reached");
        assert_eq!(ledger.remaining_at(0, now), Some(0));
    }

    #[test]
    fn refused_spend_costs_nothing() {
        let ledger = ledger(1, 3);
        let now = at("2024-03-05T09:00:00Z");

        assert!(ledger.try_spend_at(0, 2, now));
        assert!(!ledger.try_spend_at(0, 2, now));
        assert_eq!(ledger.remaining_at(0, now), Some(1));
    }

    #[test]
    fn slots_are_independent() {
        let ledger = ledger(2, 1);
        let now = at("2024-03-05T09:00:00Z");

        assert!(ledger.try_spend_at(0, 1, now));
        assert!(!ledger.try_spend_at(0, 1, now));
        assert!(ledger.try_spend_at(1, 1, now));
    }

    #[test]
    fn resets_on_cycle_boundary() {
        let ledger = ledger(1, 1);
        let evening = at("2024-03-05T22:00:00Z");

        ledger.exhaust_at(0, evening);
        assert!(!ledger.try_spend_at(0, 1, evening));

        let after_reset = at("2024-03-06T08:00:01Z");
        assert_eq!(ledger.remaining_at(0, after_reset), Some(1));
        assert!(ledger.try_spend_at(0, 1, after_reset));
        assert!(!ledger.try_spend_at(0, 1, after_reset + ChronoDuration::minutes(1)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_spends_never_exceed_the_limit() {
        let ledger = std::sync::Arc::new(ledger(1, 250));
        let now = at("2024-03-05T09:00:00Z");

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    let mut granted = 0u32;
                    for _ in 0..10 {
                        if ledger.try_spend_at(0, 1, now) {
                            granted += 1;
                        }
                        tokio::task::yield_now().await;
                    }
                    granted
                })
            })
            .collect();

        let mut granted = 0;
        for task in tasks {
            granted += task.await.unwrap();
        }

        assert_eq!(granted, 250, "640 attempts against a limit of 250");
        assert_eq!(ledger.remaining_at(0, now), Some(0));
    }

    #[test]
    fn unknown_slot_is_never_spendable() {
        let ledger = ledger(1, 100);
        assert!(!ledger.try_spend(5, 1));
        assert_eq!(ledger.remaining(5), None);
    }
}
