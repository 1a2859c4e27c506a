//! # Metrics Module
//!
//! Per-lane dispatch counters. Producers and the lane's event processor update
//! them with relaxed atomics; [`Mediator::metrics`](crate::Mediator::metrics)
//! reads a point-in-time [`MediatorMetrics`] snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one lane
#[derive(Debug, Default)]
pub struct LaneMetrics {
    /// Submissions published into the ring
    pub published_count: AtomicU64,
    /// Submissions whose handler(s) ran to success
    pub completed_count: AtomicU64,
    /// Submissions that ended in a lookup failure, handler error, or panic
    pub failed_count: AtomicU64,
    /// Submissions rejected because the ring was full
    pub shed_count: AtomicU64,
    /// Blocking callers that stopped waiting before their result arrived
    pub timed_out_count: AtomicU64,
    /// Sum of handler execution time in microseconds
    pub handler_time_us: AtomicU64,
}

impl LaneMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_publish(&self) {
        self.published_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completion(&self, latency_us: u64) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
        self.handler_time_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    pub fn record_failure(&self, latency_us: u64) {
        self.failed_count.fetch_add(1, Ordering::Relaxed);
        self.handler_time_us.fetch_add(latency_us, Ordering::Relaxed);
    }

    pub fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timed_out_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot with the ring's current queue depth filled in
    pub fn snapshot(&self, lane: usize, queue_depth: u64) -> LaneSnapshot {
        LaneSnapshot {
            lane,
            published: self.published_count.load(Ordering::Relaxed),
            completed: self.completed_count.load(Ordering::Relaxed),
            failed: self.failed_count.load(Ordering::Relaxed),
            shed: self.shed_count.load(Ordering::Relaxed),
            timed_out: self.timed_out_count.load(Ordering::Relaxed),
            handler_time_us: self.handler_time_us.load(Ordering::Relaxed),
            queue_depth,
        }
    }
}

/// Point-in-time view of one lane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneSnapshot {
    pub lane: usize,
    pub published: u64,
    pub completed: u64,
    pub failed: u64,
    pub shed: u64,
    pub timed_out: u64,
    pub handler_time_us: u64,
    /// Claimed but not yet processed
    pub queue_depth: u64,
}

impl LaneSnapshot {
    /// Mean handler time per processed submission
    pub fn mean_handler_time_us(&self) -> Option<u64> {
        let processed = self.completed + self.failed;
        (processed > 0).then(|| self.handler_time_us / processed)
    }
}

/// Snapshot of every lane of a mediator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediatorMetrics {
    pub lanes: Vec<LaneSnapshot>,
}

impl MediatorMetrics {
    /// Sum of all lanes (`lane` is set to the lane count)
    pub fn totals(&self) -> LaneSnapshot {
        self.lanes.iter().fold(
            LaneSnapshot {
                lane: self.lanes.len(),
                ..LaneSnapshot::default()
            },
            |mut acc, lane| {
                acc.published += lane.published;
                acc.completed += lane.completed;
                acc.failed += lane.failed;
                acc.shed += lane.shed;
                acc.timed_out += lane.timed_out;
                acc.handler_time_us += lane.handler_time_us;
                acc.queue_depth += lane.queue_depth;
                acc
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_metrics() {
        let metrics = LaneMetrics::new();
        let empty = metrics.snapshot(0, 0);
        assert_eq!(empty, LaneSnapshot::default());
        assert_eq!(empty.mean_handler_time_us(), None);

        metrics.record_publish();
        metrics.record_publish();
        metrics.record_completion(30);
        metrics.record_failure(10);
        metrics.record_shed();
        metrics.record_timeout();

        let snapshot = metrics.snapshot(2, 5);
        assert_eq!(snapshot.lane, 2);
        assert_eq!(snapshot.published, 2);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.shed, 1);
        assert_eq!(snapshot.timed_out, 1);
        assert_eq!(snapshot.queue_depth, 5);
        assert_eq!(snapshot.mean_handler_time_us(), Some(20));
    }

    #[test]
    fn test_mediator_metrics_totals() {
        let a = LaneMetrics::new();
        let b = LaneMetrics::new();
        a.record_publish();
        a.record_completion(4);
        b.record_publish();
        b.record_publish();
        b.record_shed();

        let metrics = MediatorMetrics {
            lanes: vec![a.snapshot(0, 0), b.snapshot(1, 2)],
        };
        let totals = metrics.totals();
        assert_eq!(totals.lane, 2);
        assert_eq!(totals.published, 3);
        assert_eq!(totals.completed, 1);
        assert_eq!(totals.shed, 1);
        assert_eq!(totals.queue_depth, 2);
    }
}
