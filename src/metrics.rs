//! Per-server metrics aggregation.
//!
//! Each logical server owns one [`MetricsAggregator`]. Terminal session
//! records are folded into it by value; live state (active count, busy time,
//! current client labels) is tracked through RAII guards. All counters sit
//! behind a single mutex and no lock is held across I/O.

use crate::session::{SessionRecord, SessionStatus};
use slab::Slab;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

struct Counters {
    admitted: u64,
    rejected: u64,
    served: u64,
    lost: u64,
    rating_sum: u64,
    rating_count: u64,
    /// Sum of per-session handler time, for average response time.
    service_time: Duration,
    /// Labels of clients currently inside a protocol handler.
    active: Slab<String>,
    /// Accumulated wall-clock with at least one active session.
    busy: Duration,
    busy_since: Option<Instant>,
    started: Instant,
}

impl Counters {
    fn new(now: Instant) -> Self {
        Counters {
            admitted: 0,
            rejected: 0,
            served: 0,
            lost: 0,
            rating_sum: 0,
            rating_count: 0,
            service_time: Duration::ZERO,
            active: Slab::new(),
            busy: Duration::ZERO,
            busy_since: None,
            started: now,
        }
    }

    fn busy_as_of(&self, now: Instant) -> Duration {
        match self.busy_since {
            Some(since) => self.busy + now.saturating_duration_since(since),
            None => self.busy,
        }
    }
}

/// Thread-safe counters and rating accumulation for one server.
pub struct MetricsAggregator {
    name: String,
    endpoint: String,
    max_concurrency: usize,
    inner: Mutex<Counters>,
}

impl MetricsAggregator {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        max_concurrency: usize,
    ) -> Arc<Self> {
        Arc::new(MetricsAggregator {
            name: name.into(),
            endpoint: endpoint.into(),
            max_concurrency,
            inner: Mutex::new(Counters::new(Instant::now())),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A connection entered the admission queue.
    pub fn record_admitted(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.admitted += 1;
    }

    /// A connection was turned away because the queue was full. Rejected
    /// connections were never admitted and do not count as lost.
    pub fn record_rejected(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.rejected += 1;
    }

    /// Fold a terminal session record into the counters. Ratings only
    /// accumulate for completed sessions that actually carried one.
    pub fn record(&self, record: SessionRecord) {
        debug_assert!(record.status().is_terminal());
        let mut inner = self.inner.lock().unwrap();
        match record.status() {
            SessionStatus::Completed => {
                inner.served += 1;
                if let Some(rating) = record.rating() {
                    inner.rating_sum += u64::from(rating);
                    inner.rating_count += 1;
                }
                if let Some(service) = record.service_time() {
                    inner.service_time += service;
                }
            }
            SessionStatus::TimeoutLost | SessionStatus::ConnectionLost => {
                inner.lost += 1;
            }
            SessionStatus::Pending | SessionStatus::Active => {}
        }
    }

    /// Mark `client` as actively served until the returned guard drops.
    pub fn begin_active(self: &Arc<Self>, client: &str) -> ActiveGuard {
        let key = {
            let mut inner = self.inner.lock().unwrap();
            debug_assert!(inner.active.len() < self.max_concurrency);
            if inner.active.is_empty() {
                inner.busy_since = Some(Instant::now());
            }
            inner.active.insert(client.to_string())
        };
        ActiveGuard {
            metrics: Arc::clone(self),
            key,
        }
    }

    fn end_active(&self, key: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.active.remove(key);
        if inner.active.is_empty() {
            if let Some(since) = inner.busy_since.take() {
                inner.busy += since.elapsed();
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_at(Instant::now())
    }

    /// Point-in-time copy of the counters. Two snapshots taken at the same
    /// instant with no intervening records compare equal.
    pub fn snapshot_at(&self, now: Instant) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        MetricsSnapshot {
            server: self.name.clone(),
            endpoint: self.endpoint.clone(),
            max_concurrency: self.max_concurrency,
            active_count: inner.active.len(),
            admitted: inner.admitted,
            rejected: inner.rejected,
            served: inner.served,
            lost: inner.lost,
            rating_sum: inner.rating_sum,
            rating_count: inner.rating_count,
            current_client: inner.active.iter().next().map(|(_, c)| c.clone()),
            elapsed: now.saturating_duration_since(inner.started),
            busy: inner.busy_as_of(now),
            service_time: inner.service_time,
        }
    }

    /// Zero the counters. Sessions currently active stay active and keep
    /// accruing busy time from now on.
    pub fn reset(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.admitted = 0;
        inner.rejected = 0;
        inner.served = 0;
        inner.lost = 0;
        inner.rating_sum = 0;
        inner.rating_count = 0;
        inner.service_time = Duration::ZERO;
        inner.busy = Duration::ZERO;
        inner.busy_since = if inner.active.is_empty() {
            None
        } else {
            Some(now)
        };
        inner.started = now;
    }
}

/// Decrements the active count (and closes the busy interval if this was the
/// last active session) when dropped.
pub struct ActiveGuard {
    metrics: Arc<MetricsAggregator>,
    key: usize,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.metrics.end_active(self.key);
    }
}

/// Immutable point-in-time view of one server's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub server: String,
    pub endpoint: String,
    pub max_concurrency: usize,
    pub active_count: usize,
    pub admitted: u64,
    pub rejected: u64,
    pub served: u64,
    pub lost: u64,
    pub rating_sum: u64,
    pub rating_count: u64,
    pub current_client: Option<String>,
    pub elapsed: Duration,
    pub busy: Duration,
    pub service_time: Duration,
}

impl MetricsSnapshot {
    /// Average over completed sessions that carried a rating; 0.0 otherwise.
    pub fn average_rating(&self) -> f64 {
        if self.rating_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.rating_count as f64
        }
    }

    /// Served sessions per elapsed second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.served as f64 / secs
        }
    }

    /// Fraction of elapsed wall-clock with at least one active session.
    pub fn utilization(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            (self.busy.as_secs_f64() / secs).min(1.0)
        }
    }

    /// Mean handler time per served session, in seconds.
    pub fn average_response_time(&self) -> f64 {
        self.service_time.as_secs_f64() / self.served.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(metrics: &Arc<MetricsAggregator>, client: &str, rating: u8) {
        let t0 = Instant::now();
        let mut record = SessionRecord::new(client, 0, t0);
        record.activate(t0);
        record.complete(rating, t0 + Duration::from_millis(100));
        metrics.record(record);
    }

    fn lost(metrics: &Arc<MetricsAggregator>, client: &str) {
        let t0 = Instant::now();
        let mut record = SessionRecord::new(client, 0, t0);
        record.activate(t0);
        record.lose_connection(t0 + Duration::from_millis(50));
        metrics.record(record);
    }

    #[test]
    fn test_served_and_lost_counting() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        metrics.record_admitted();
        metrics.record_admitted();
        metrics.record_admitted();
        completed(&metrics, "Client_0000", 4);
        completed(&metrics, "Client_0001", 5);
        lost(&metrics, "Client_0002");

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 3);
        assert_eq!(snap.served, 2);
        assert_eq!(snap.lost, 1);
        assert!(snap.served + snap.lost <= snap.admitted);
        assert_eq!(snap.rating_sum, 9);
        assert_eq!(snap.rating_count, 2);
        assert_eq!(snap.average_rating(), 4.5);
    }

    #[test]
    fn test_unrated_sessions_do_not_affect_average() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        completed(&metrics, "Client_0000", 3);
        lost(&metrics, "Client_0001");
        lost(&metrics, "Client_0002");

        let snap = metrics.snapshot();
        assert_eq!(snap.rating_count, 1);
        assert_eq!(snap.average_rating(), 3.0);
        assert!(snap.rating_sum <= 5 * snap.rating_count);
    }

    #[test]
    fn test_empty_average_is_zero() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        assert_eq!(metrics.snapshot().average_rating(), 0.0);
    }

    #[test]
    fn test_snapshot_is_idempotent() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        completed(&metrics, "Client_0000", 5);

        let now = Instant::now();
        let a = metrics.snapshot_at(now);
        let b = metrics.snapshot_at(now);
        assert_eq!(a, b);
    }

    #[test]
    fn test_active_guard_tracks_count_and_label() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        assert_eq!(metrics.snapshot().active_count, 0);

        let guard_a = metrics.begin_active("Client_0000");
        let guard_b = metrics.begin_active("Client_0001");
        let snap = metrics.snapshot();
        assert_eq!(snap.active_count, 2);
        assert!(snap.active_count <= snap.max_concurrency);
        assert_eq!(snap.current_client.as_deref(), Some("Client_0000"));

        drop(guard_a);
        drop(guard_b);
        let snap = metrics.snapshot();
        assert_eq!(snap.active_count, 0);
        assert_eq!(snap.current_client, None);
    }

    #[test]
    fn test_busy_time_accumulates_while_active() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        {
            let _guard = metrics.begin_active("Client_0000");
            std::thread::sleep(Duration::from_millis(30));
        }
        let snap = metrics.snapshot();
        assert!(snap.busy >= Duration::from_millis(25));
        assert!(snap.utilization() > 0.0);
        assert!(snap.utilization() <= 1.0);
    }

    #[test]
    fn test_reset_clears_counters() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        metrics.record_admitted();
        completed(&metrics, "Client_0000", 5);
        metrics.reset();

        let snap = metrics.snapshot();
        assert_eq!(snap.admitted, 0);
        assert_eq!(snap.served, 0);
        assert_eq!(snap.rating_sum, 0);
        assert_eq!(snap.busy, Duration::ZERO);
    }

    #[test]
    fn test_average_response_time() {
        let metrics = MetricsAggregator::new("Server_A", "127.0.0.1:8000", 5);
        completed(&metrics, "Client_0000", 5);
        completed(&metrics, "Client_0001", 5);
        let snap = metrics.snapshot();
        // Two sessions at 100ms of handler time each.
        assert!((snap.average_response_time() - 0.1).abs() < 0.01);
    }
}
