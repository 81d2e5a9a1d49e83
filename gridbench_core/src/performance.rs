//! Performance probes and statistics aggregation.
//!
//! ```text
//!  timestep threads        worker                         coordinator
//!  ┌────────┐ record  ┌──────────────────┐  interval  ┌─────────────────────┐
//!  │ Probe  │───────▶ │ PerformanceTracker│──────────▶ │ PerformanceCollector │
//!  └────────┘         │  (delta per test) │  stats     │ (merge per test)     │
//!                     └──────────────────┘            └─────────────────────┘
//! ```
//!
//! Both [`PerformanceState`] and [`IntervalStats`] combine with `add`, which
//! is associative and commutative with the empty value as identity, so
//! per-thread and per-worker values can be merged in any order.

use gridbench_env::SimulatorAddress;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// =============================================================================
// PROBE
// =============================================================================

/// Latency and iteration recorder owned by a single timestep thread.
///
/// Only the owning thread writes, so updates are plain relaxed stores rather
/// than read-modify-write operations. Readers may observe slightly stale
/// values. The one exception is the interval maximum, which the reader
/// resets with [`Probe::take_snapshot`]; a sample recorded right at that
/// moment may land in either interval.
#[derive(Debug)]
pub struct Probe {
    name: Arc<str>,
    operations: AtomicU64,
    latency_total_nanos: AtomicU64,
    latency_max_nanos: AtomicU64,
    interval_max_nanos: AtomicU64,
}

impl Default for Probe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_NAME)
    }
}

/// Name of the timestep probe unless a test picks its own.
pub const DEFAULT_PROBE_NAME: &str = "timeStep";

impl Probe {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            operations: AtomicU64::new(0),
            latency_total_nanos: AtomicU64::new(0),
            latency_max_nanos: AtomicU64::new(0),
            interval_max_nanos: AtomicU64::new(0),
        }
    }

    /// The operation this probe measures.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records one completed iteration. Must only be called by the owner.
    #[inline]
    pub fn record(&self, latency: Duration) {
        let nanos = latency.as_nanos().min(u64::MAX as u128) as u64;
        let ops = self.operations.load(Ordering::Relaxed);
        self.operations.store(ops + 1, Ordering::Relaxed);
        let total = self.latency_total_nanos.load(Ordering::Relaxed);
        self.latency_total_nanos
            .store(total.saturating_add(nanos), Ordering::Relaxed);
        if nanos > self.latency_max_nanos.load(Ordering::Relaxed) {
            self.latency_max_nanos.store(nanos, Ordering::Relaxed);
        }
        if nanos > self.interval_max_nanos.load(Ordering::Relaxed) {
            self.interval_max_nanos.store(nanos, Ordering::Relaxed);
        }
    }

    /// Reads the counters without side effects.
    pub fn snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            latency_total_nanos: self.latency_total_nanos.load(Ordering::Relaxed),
            latency_max_nanos: self.latency_max_nanos.load(Ordering::Relaxed),
            interval_max_nanos: self.interval_max_nanos.load(Ordering::Relaxed),
        }
    }

    /// Reads the counters and starts a new interval maximum.
    pub fn take_snapshot(&self) -> ProbeSnapshot {
        ProbeSnapshot {
            operations: self.operations.load(Ordering::Relaxed),
            latency_total_nanos: self.latency_total_nanos.load(Ordering::Relaxed),
            latency_max_nanos: self.latency_max_nanos.load(Ordering::Relaxed),
            interval_max_nanos: self.interval_max_nanos.swap(0, Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one or more probes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSnapshot {
    pub operations: u64,
    pub latency_total_nanos: u64,
    /// Slowest operation since the probe was created
    pub latency_max_nanos: u64,
    /// Slowest operation since the previous [`Probe::take_snapshot`]
    pub interval_max_nanos: u64,
}

impl ProbeSnapshot {
    pub fn add(&self, other: &ProbeSnapshot) -> ProbeSnapshot {
        ProbeSnapshot {
            operations: self.operations + other.operations,
            latency_total_nanos: self.latency_total_nanos.saturating_add(other.latency_total_nanos),
            latency_max_nanos: self.latency_max_nanos.max(other.latency_max_nanos),
            interval_max_nanos: self.interval_max_nanos.max(other.interval_max_nanos),
        }
    }
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Throughput figures for one test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceState {
    /// Operations executed since the test started
    pub operation_count: u64,

    /// Operations per second during the last interval
    pub interval_throughput: f64,

    /// Operations per second since the test started
    pub total_throughput: f64,
}

impl PerformanceState {
    /// The identity for [`PerformanceState::add`].
    pub const EMPTY: PerformanceState = PerformanceState {
        operation_count: 0,
        interval_throughput: 0.0,
        total_throughput: 0.0,
    };

    pub fn new(operation_count: u64, interval_throughput: f64, total_throughput: f64) -> Self {
        Self {
            operation_count,
            interval_throughput,
            total_throughput,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operation_count == 0
    }

    /// Combines the figures of two independent sources.
    pub fn add(&self, other: &PerformanceState) -> PerformanceState {
        PerformanceState {
            operation_count: self.operation_count + other.operation_count,
            interval_throughput: self.interval_throughput + other.interval_throughput,
            total_throughput: self.total_throughput + other.total_throughput,
        }
    }
}

/// Operation count and latency distribution for one interval.
///
/// `latency_max_nanos` is the slowest operation of the interval itself, so
/// merging intervals yields the slowest operation over all of them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalStats {
    pub operation_count: u64,
    pub latency_total_nanos: u64,
    pub latency_max_nanos: u64,
}

impl IntervalStats {
    pub const EMPTY: IntervalStats = IntervalStats {
        operation_count: 0,
        latency_total_nanos: 0,
        latency_max_nanos: 0,
    };

    pub fn add(&self, other: &IntervalStats) -> IntervalStats {
        IntervalStats {
            operation_count: self.operation_count + other.operation_count,
            latency_total_nanos: self.latency_total_nanos.saturating_add(other.latency_total_nanos),
            latency_max_nanos: self.latency_max_nanos.max(other.latency_max_nanos),
        }
    }

    /// Mean latency in microseconds, `0.0` if nothing was recorded.
    pub fn mean_latency_us(&self) -> f64 {
        if self.operation_count == 0 {
            return 0.0;
        }
        self.latency_total_nanos as f64 / self.operation_count as f64 / 1_000.0
    }

    pub fn max_latency_us(&self) -> f64 {
        self.latency_max_nanos as f64 / 1_000.0
    }
}

// =============================================================================
// WORKER SIDE
// =============================================================================

struct TrackedTest {
    started_at: Instant,
    last_at: Instant,
    last: ProbeSnapshot,
}

/// Turns cumulative probe snapshots into per-interval statistics.
#[derive(Default)]
pub struct PerformanceTracker {
    tests: HashMap<String, TrackedTest>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the moment a test started producing operations.
    pub fn start(&mut self, test_id: &str, now: Instant) {
        self.tests.insert(
            test_id.to_string(),
            TrackedTest {
                started_at: now,
                last_at: now,
                last: ProbeSnapshot::default(),
            },
        );
    }

    /// True if `start` or `update` has been called for the test.
    pub fn is_tracking(&self, test_id: &str) -> bool {
        self.tests.contains_key(test_id)
    }

    /// Number of tests currently tracked.
    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Feeds the current cumulative snapshot of a test.
    ///
    /// The snapshot's interval maximum must cover exactly the time since
    /// the previous update (see [`Probe::take_snapshot`]). A test that was
    /// never started is started at `now`. Returns `None` when nothing
    /// happened since the previous update.
    pub fn update(
        &mut self,
        test_id: &str,
        current: ProbeSnapshot,
        now: Instant,
    ) -> Option<(PerformanceState, IntervalStats)> {
        let tracked = self
            .tests
            .entry(test_id.to_string())
            .or_insert_with(|| TrackedTest {
                started_at: now,
                last_at: now,
                last: ProbeSnapshot::default(),
            });

        let delta_ops = current.operations.saturating_sub(tracked.last.operations);
        if delta_ops == 0 {
            return None;
        }
        let interval_secs = now.duration_since(tracked.last_at).as_secs_f64();
        let total_secs = now.duration_since(tracked.started_at).as_secs_f64();
        let throughput = |ops: u64, secs: f64| if secs > 0.0 { ops as f64 / secs } else { 0.0 };

        let state = PerformanceState::new(
            current.operations,
            throughput(delta_ops, interval_secs),
            throughput(current.operations, total_secs),
        );
        let interval = IntervalStats {
            operation_count: delta_ops,
            latency_total_nanos: current
                .latency_total_nanos
                .saturating_sub(tracked.last.latency_total_nanos),
            latency_max_nanos: current.interval_max_nanos,
        };

        tracked.last = current;
        tracked.last_at = now;
        Some((state, interval))
    }

    /// Stops tracking a test.
    pub fn remove(&mut self, test_id: &str) {
        self.tests.remove(test_id);
    }
}

// =============================================================================
// COORDINATOR SIDE
// =============================================================================

/// Merges statistics reported by many workers.
#[derive(Default)]
pub struct PerformanceCollector {
    latest: RwLock<HashMap<String, BTreeMap<SimulatorAddress, PerformanceState>>>,
    intervals: RwLock<HashMap<String, IntervalStats>>,
}

impl PerformanceCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the latest state reported by `worker` for each test.
    pub fn update(&self, worker: SimulatorAddress, stats: BTreeMap<String, PerformanceState>) {
        let mut latest = self.latest.write();
        for (test_id, state) in stats {
            latest.entry(test_id).or_default().insert(worker, state);
        }
    }

    /// Accumulates interval statistics.
    pub fn record_intervals(&self, stats: BTreeMap<String, IntervalStats>) {
        let mut intervals = self.intervals.write();
        for (test_id, interval) in stats {
            let entry = intervals.entry(test_id).or_default();
            *entry = entry.add(&interval);
        }
    }

    /// Cluster-wide state of a test.
    pub fn total(&self, test_id: &str) -> PerformanceState {
        self.latest
            .read()
            .get(test_id)
            .map(|per_worker| {
                per_worker
                    .values()
                    .fold(PerformanceState::EMPTY, |acc, s| acc.add(s))
            })
            .unwrap_or(PerformanceState::EMPTY)
    }

    /// Accumulated interval statistics of a test.
    pub fn intervals(&self, test_id: &str) -> IntervalStats {
        self.intervals
            .read()
            .get(test_id)
            .copied()
            .unwrap_or(IntervalStats::EMPTY)
    }

    /// Number of workers that reported for a test.
    pub fn reporting_workers(&self, test_id: &str) -> usize {
        self.latest.read().get(test_id).map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state_strategy() -> impl Strategy<Value = PerformanceState> {
        // Whole numbers keep float addition exact.
        (0u64..1_000_000, 0u32..1_000_000, 0u32..1_000_000)
            .prop_map(|(ops, i, t)| PerformanceState::new(ops, i as f64, t as f64))
    }

    proptest! {
        #[test]
        fn test_empty_is_identity(x in state_strategy()) {
            prop_assert_eq!(PerformanceState::EMPTY.add(&x), x);
            prop_assert_eq!(x.add(&PerformanceState::EMPTY), x);
        }

        #[test]
        fn test_add_is_commutative(a in state_strategy(), b in state_strategy()) {
            prop_assert_eq!(a.add(&b), b.add(&a));
        }

        #[test]
        fn test_add_is_associative(
            a in state_strategy(),
            b in state_strategy(),
            c in state_strategy(),
        ) {
            prop_assert_eq!(a.add(&b).add(&c), a.add(&b.add(&c)));
        }

        #[test]
        fn test_interval_add_is_commutative(
            a in (0u64..1000, 0u64..1_000_000, 0u64..1000),
            b in (0u64..1000, 0u64..1_000_000, 0u64..1000),
        ) {
            let a = IntervalStats { operation_count: a.0, latency_total_nanos: a.1, latency_max_nanos: a.2 };
            let b = IntervalStats { operation_count: b.0, latency_total_nanos: b.1, latency_max_nanos: b.2 };
            prop_assert_eq!(a.add(&b), b.add(&a));
            prop_assert_eq!(IntervalStats::EMPTY.add(&a), a);
        }
    }

    #[test]
    fn test_recorder_counts_operations() {
        let probe = Probe::new("get");
        assert_eq!(probe.name(), "get");
        probe.record(Duration::from_micros(10));
        probe.record(Duration::from_micros(30));
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.operations, 2);
        assert_eq!(snapshot.latency_total_nanos, 40_000);
        assert_eq!(snapshot.latency_max_nanos, 30_000);
        assert_eq!(snapshot.interval_max_nanos, 30_000);
        // A plain snapshot leaves the interval running.
        assert_eq!(probe.snapshot().interval_max_nanos, 30_000);
        assert_eq!(Probe::default().name(), DEFAULT_PROBE_NAME);
    }

    #[test]
    fn test_take_snapshot_starts_new_interval_max() {
        let probe = Probe::new("put");
        probe.record(Duration::from_millis(5));
        assert_eq!(probe.take_snapshot().interval_max_nanos, 5_000_000);

        probe.record(Duration::from_micros(2));
        let snapshot = probe.take_snapshot();
        assert_eq!(snapshot.interval_max_nanos, 2_000);
        assert_eq!(snapshot.latency_max_nanos, 5_000_000);
        assert_eq!(probe.take_snapshot().interval_max_nanos, 0);
    }

    #[test]
    fn test_slow_operation_only_marks_its_own_interval() {
        let probe = Probe::new("get");
        let mut tracker = PerformanceTracker::new();
        let start = Instant::now();
        tracker.start("foo", start);

        probe.record(Duration::from_millis(900));
        probe.record(Duration::from_micros(100));
        let (_, first) = tracker
            .update("foo", probe.take_snapshot(), start + Duration::from_secs(1))
            .unwrap();
        assert_eq!(first.latency_max_nanos, 900_000_000);

        for _ in 0..10 {
            probe.record(Duration::from_micros(100));
        }
        let (_, second) = tracker
            .update("foo", probe.take_snapshot(), start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(second.operation_count, 10);
        assert_eq!(second.latency_max_nanos, 100_000);
        assert_eq!(first.add(&second).latency_max_nanos, 900_000_000);
    }

    #[test]
    fn test_tracker_forgets_removed_tests() {
        let mut tracker = PerformanceTracker::new();
        let now = Instant::now();
        tracker.start("foo", now);
        tracker.start("bar", now);
        assert_eq!(tracker.len(), 2);
        tracker.remove("foo");
        assert!(!tracker.is_tracking("foo"));
        assert!(tracker.is_tracking("bar"));
        tracker.remove("bar");
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tracker_computes_deltas() {
        let mut tracker = PerformanceTracker::new();
        let start = Instant::now();
        tracker.start("foo", start);
        let first = ProbeSnapshot {
            operations: 100,
            latency_total_nanos: 1_000,
            latency_max_nanos: 50,
            interval_max_nanos: 50,
        };
        let (state, interval) = tracker.update("foo", first, start + Duration::from_secs(1)).unwrap();
        assert_eq!(state.operation_count, 100);
        assert_eq!(interval.operation_count, 100);

        let second = ProbeSnapshot {
            operations: 300,
            latency_total_nanos: 3_000,
            latency_max_nanos: 80,
            interval_max_nanos: 80,
        };
        let (state, interval) = tracker.update("foo", second, start + Duration::from_secs(2)).unwrap();
        assert_eq!(state.operation_count, 300);
        assert_eq!(interval.operation_count, 200);
        assert_eq!(interval.latency_total_nanos, 2_000);
        assert!((state.interval_throughput - 200.0).abs() < 1e-6);

        assert!(tracker.update("foo", second, start + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn test_collector_merges_workers() {
        let collector = PerformanceCollector::new();
        let w1 = SimulatorAddress::worker(1, 1);
        let w2 = SimulatorAddress::worker(2, 1);
        collector.update(w1, BTreeMap::from([("foo".to_string(), PerformanceState::new(10, 5.0, 5.0))]));
        collector.update(w2, BTreeMap::from([("foo".to_string(), PerformanceState::new(20, 7.0, 6.0))]));
        // A newer report from the same worker replaces the older one.
        collector.update(w1, BTreeMap::from([("foo".to_string(), PerformanceState::new(15, 5.0, 5.0))]));

        let total = collector.total("foo");
        assert_eq!(total.operation_count, 35);
        assert_eq!(collector.reporting_workers("foo"), 2);
        assert_eq!(collector.total("bar"), PerformanceState::EMPTY);
    }
}
