//! Performance monitoring: hot-path counters, latency windows, snapshots and advisories.
//!
//! Producers and dispatch workers update the [`PerformanceMonitor`] through atomics only: every
//! counter is an `AtomicU64` and latency samples land in fixed-length rings of atomics, so the hot
//! path never allocates or locks. The control tick turns those counters into an immutable
//! [`MetricsSnapshot`], which is what callers, the adaptive batcher and the exporter read.
//!
//! Alerting is decoupled from logging: the monitor pushes [`Advisory`] records into a bounded
//! channel and never throttles producers itself. The scheduler core drains that channel.

use crate::config::SchedulerConfig;
use crate::event::{DropReason, Event};
use crate::priority::{Category, CategoryTable, Priority, PriorityTable};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Fixed-length ring of latency samples (microseconds) written with atomics only.
#[derive(Debug)]
struct LatencyRing {
    slots: Box<[AtomicU64]>,
    head: AtomicU64,
}

impl LatencyRing {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len.max(1)).map(|_| AtomicU64::new(0)).collect(),
            head: AtomicU64::new(0),
        }
    }

    // The head moves before the slot is written, so a concurrent reader may see one stale
    // sample. Percentiles over the window tolerate that.
    #[inline]
    fn record(&self, micros: u64) {
        let idx = self.head.fetch_add(1, Ordering::Relaxed) as usize % self.slots.len();
        self.slots[idx].store(micros, Ordering::Relaxed);
    }

    /// Copy the samples currently held (at most one window).
    fn collect_into(&self, out: &mut Vec<u64>) {
        let filled = (self.head.load(Ordering::Acquire) as usize).min(self.slots.len());
        out.extend(
            self.slots[..filled]
                .iter()
                .map(|slot| slot.load(Ordering::Relaxed)),
        );
    }
}

/// Per-priority hot-path counters.
#[derive(Debug, Default)]
struct PriorityCounters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    late: AtomicU64,
    evicted: AtomicU64,
    expired: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    rejected_full: AtomicU64,
    rejected_closed: AtomicU64,
    rejected_oversized: AtomicU64,
}

#[derive(Debug, Default)]
struct CategoryCounters {
    batches_formed: AtomicU64,
    batched_events: AtomicU64,
}

/// Lane depths and capacities handed to [`PerformanceMonitor::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneOccupancy {
    pub depth: CategoryTable<PriorityTable<usize>>,
    pub capacity: PriorityTable<usize>,
}

impl LaneOccupancy {
    pub fn empty(capacity: PriorityTable<usize>) -> Self {
        Self {
            depth: CategoryTable::from_fn(|_| PriorityTable::from_fn(|_| 0)),
            capacity,
        }
    }

    pub fn total_depth(&self) -> usize {
        self.depth
            .iter()
            .flat_map(|(_, table)| table.iter().map(|(_, depth)| *depth))
            .sum()
    }
}

/// Kind of advisory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdvisoryKind {
    /// A lane passed the configured occupancy fraction.
    QueueBacklog,
    /// Critical p95 latency stayed above target for the configured number of ticks.
    LatencyBreach,
    /// A consumer fell behind: hand-off queue full or one handler call ran too long.
    WorkerStall,
}

/// Advisory record for an external logging/alerting collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub kind: AdvisoryKind,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    /// Depth (QueueBacklog), p95 in microseconds (LatencyBreach) or stall in microseconds.
    pub value: f64,
    /// Wall-clock time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Advisory {
    fn new(
        kind: AdvisoryKind,
        category: Option<Category>,
        priority: Option<Priority>,
        value: f64,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);
        Self {
            kind,
            category,
            priority,
            value,
            timestamp_ms,
        }
    }
}

/// Statistics for one priority class, aggregated over all categories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityStats {
    pub enqueued: u64,
    pub dispatched: u64,
    pub late: u64,
    pub evicted: u64,
    pub expired: u64,
    pub dropped_on_shutdown: u64,
    pub rejected_full: u64,
    pub rejected_closed: u64,
    pub rejected_oversized: u64,
    #[serde(with = "duration_micros_option")]
    pub p50: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub p95: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub p99: Option<Duration>,
    #[serde(with = "duration_micros_option")]
    pub max: Option<Duration>,
    /// Resident events across every category's lane of this priority.
    pub queue_depth: usize,
    /// Capacity of each category's lane of this priority.
    pub lane_capacity: usize,
}

impl PriorityStats {
    /// Events admitted but not delivered.
    pub fn dropped(&self) -> u64 {
        self.evicted + self.expired + self.dropped_on_shutdown
    }
}

/// Statistics for one category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryStats {
    pub queue_depth: PriorityTable<usize>,
    pub p95: PriorityTable<Option<Duration>>,
    pub batches_formed: u64,
    pub average_batch_size: f64,
}

/// Point-in-time, read-only copy of the monitor's counters.
///
/// Throughput is computed at control ticks rather than on read, so two snapshots taken with no
/// intervening activity compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_per_sec: f64,
    pub enqueued_total: u64,
    pub dispatched_total: u64,
    pub dropped_total: u64,
    /// Contended lane-lock acquisitions divided by all acquisitions.
    pub contention_ratio: f64,
    pub advisories_emitted: u64,
    pub advisories_dropped: u64,
    /// Longest single dispatch tick since the monitor was created.
    #[serde(with = "duration_micros")]
    pub max_tick_duration: Duration,
    pub priorities: PriorityTable<PriorityStats>,
    pub categories: CategoryTable<CategoryStats>,
}

impl MetricsSnapshot {
    pub fn p95(&self, priority: Priority) -> Option<Duration> {
        self.priorities[priority].p95
    }

    pub fn category_p95(&self, category: Category, priority: Priority) -> Option<Duration> {
        self.categories[category].p95[priority]
    }

    pub fn queue_depth(&self, category: Category, priority: Priority) -> usize {
        self.categories[category].queue_depth[priority]
    }

    pub fn dropped(&self, priority: Priority) -> u64 {
        self.priorities[priority].dropped()
    }
}

mod duration_micros {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_micros() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_micros(u64::deserialize(deserializer)?))
    }
}

mod duration_micros_option {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    // Microseconds as f64 keep sub-millisecond precision readable in JSON.
    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1_000_000.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<f64> = Option::deserialize(deserializer)?;
        Ok(opt.map(|micros| Duration::from_secs_f64(micros / 1_000_000.0)))
    }
}

/// Percentiles over a sample set using the nearest-rank method.
fn percentile(sorted: &[u64], pct: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }
    let len = sorted.len();
    let idx = ((len as f64 * pct / 100.0).ceil() as usize)
        .saturating_sub(1)
        .min(len - 1);
    Some(Duration::from_micros(sorted[idx]))
}

/// Alerting thresholds copied from the configuration.
#[derive(Debug, Clone)]
struct AlertSettings {
    critical_target: Duration,
    consecutive_ticks: u32,
    backlog_fraction: f64,
}

struct ThroughputSample {
    at: Instant,
    dispatched_total: u64,
}

/// Collects throughput, latency, queue depth and contention samples.
pub struct PerformanceMonitor {
    priorities: PriorityTable<PriorityCounters>,
    categories: CategoryTable<CategoryCounters>,
    latencies: CategoryTable<PriorityTable<LatencyRing>>,
    lock_acquisitions: AtomicU64,
    lock_contended: AtomicU64,
    max_tick_micros: AtomicU64,
    events_per_sec_bits: AtomicU64,
    last_sample: Mutex<Option<ThroughputSample>>,
    breach_streak: AtomicU32,
    /// Critical dispatched count seen by the previous `evaluate`, to skip stale latency windows.
    breach_dispatched: AtomicU64,
    backlog_flags: CategoryTable<PriorityTable<AtomicBool>>,
    alerts: AlertSettings,
    advisory_tx: Sender<Advisory>,
    advisories_emitted: AtomicU64,
    advisories_dropped: AtomicU64,
}

impl PerformanceMonitor {
    /// Create a monitor sized from `config`, emitting advisories into `advisory_tx`.
    pub fn new(config: &SchedulerConfig, advisory_tx: Sender<Advisory>) -> Self {
        Self {
            priorities: PriorityTable::from_fn(|_| PriorityCounters::default()),
            categories: CategoryTable::from_fn(|_| CategoryCounters::default()),
            latencies: CategoryTable::from_fn(|_| {
                PriorityTable::from_fn(|_| LatencyRing::new(config.latency_window))
            }),
            lock_acquisitions: AtomicU64::new(0),
            lock_contended: AtomicU64::new(0),
            max_tick_micros: AtomicU64::new(0),
            events_per_sec_bits: AtomicU64::new(0f64.to_bits()),
            last_sample: Mutex::new(None),
            breach_streak: AtomicU32::new(0),
            breach_dispatched: AtomicU64::new(0),
            backlog_flags: CategoryTable::from_fn(|_| {
                PriorityTable::from_fn(|_| AtomicBool::new(false))
            }),
            alerts: AlertSettings {
                critical_target: config.target_latency[Priority::Critical],
                consecutive_ticks: config.alert_consecutive_ticks,
                backlog_fraction: config.backlog_alert_fraction,
            },
            advisory_tx,
            advisories_emitted: AtomicU64::new(0),
            advisories_dropped: AtomicU64::new(0),
        }
    }

    /// Count an admitted event.
    #[inline]
    pub fn record_enqueue(&self, event: &Event) {
        self.priorities[event.priority()]
            .enqueued
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Count a delivery and store its latency sample.
    #[inline]
    pub fn record_dispatch(&self, event: &Event, delivered_at: Instant) {
        let counters = &self.priorities[event.priority()];
        counters.dispatched.fetch_add(1, Ordering::Relaxed);
        if event.is_late_at(delivered_at) {
            counters.late.fetch_add(1, Ordering::Relaxed);
        }
        let micros = event.latency_at(delivered_at).as_micros() as u64;
        self.latencies[event.category()][event.priority()].record(micros);
    }

    #[inline]
    pub fn record_batch(&self, category: Category, size: usize) {
        let counters = &self.categories[category];
        counters.batches_formed.fetch_add(1, Ordering::Relaxed);
        counters
            .batched_events
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Count `count` admitted events of `priority` that left without delivery.
    #[inline]
    pub fn record_drop(&self, priority: Priority, reason: DropReason, count: u64) {
        let counters = &self.priorities[priority];
        let counter = match reason {
            DropReason::Evicted => &counters.evicted,
            DropReason::Expired => &counters.expired,
            DropReason::ShutdownDrop => &counters.dropped_on_shutdown,
        };
        counter.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reject(&self, priority: Priority, reason: crate::error::RejectReason) {
        use crate::error::RejectReason;
        let counters = &self.priorities[priority];
        let counter = match reason {
            RejectReason::Full => &counters.rejected_full,
            RejectReason::Closed => &counters.rejected_closed,
            RejectReason::PayloadTooLarge { .. } => &counters.rejected_oversized,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one lane-lock acquisition and whether it had to wait.
    #[inline]
    pub fn record_lock(&self, contended: bool) {
        self.lock_acquisitions.fetch_add(1, Ordering::Relaxed);
        if contended {
            self.lock_contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Track the longest dispatch tick observed.
    #[inline]
    pub fn record_tick(&self, elapsed: Duration) {
        self.max_tick_micros
            .fetch_max(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// One handler call ran for `stalled_for`. Always advisory, never throttling.
    pub fn record_worker_stall(&self, category: Category, stalled_for: Duration) {
        self.emit(Advisory::new(
            AdvisoryKind::WorkerStall,
            Some(category),
            None,
            stalled_for.as_micros() as f64,
        ));
    }

    /// A consumer's hand-off queue is full with `pending` deliveries waiting.
    pub fn record_handoff_stall(&self, category: Category, pending: usize) {
        self.emit(Advisory::new(
            AdvisoryKind::WorkerStall,
            Some(category),
            None,
            pending as f64,
        ));
    }

    /// Events delivered so far, without building a snapshot.
    pub fn dispatched_total(&self) -> u64 {
        self.priorities
            .iter()
            .map(|(_, c)| c.dispatched.load(Ordering::Relaxed))
            .sum()
    }

    /// Recompute events/sec from the dispatched total since the previous sample.
    ///
    /// Called once per control tick; the first call only establishes the baseline.
    pub fn sample_throughput(&self, now: Instant) {
        let dispatched_total = self.dispatched_total();
        let mut last = self.last_sample.lock();
        if let Some(prev) = last.as_ref() {
            let elapsed = now.saturating_duration_since(prev.at).as_secs_f64();
            if elapsed > 0.0 {
                let rate = dispatched_total.saturating_sub(prev.dispatched_total) as f64 / elapsed;
                self.events_per_sec_bits
                    .store(rate.to_bits(), Ordering::Relaxed);
            }
        }
        *last = Some(ThroughputSample {
            at: now,
            dispatched_total,
        });
    }

    /// Build an immutable snapshot. Percentiles are computed here, off the hot path.
    pub fn snapshot(&self, occupancy: &LaneOccupancy) -> MetricsSnapshot {
        let mut scratch = Vec::new();
        let mut category_p95 = CategoryTable::from_fn(|_| PriorityTable::from_fn(|_| None));

        let priorities = PriorityTable::from_fn(|priority| {
            let mut merged = Vec::new();
            for category in Category::ALL {
                scratch.clear();
                self.latencies[category][priority].collect_into(&mut scratch);
                scratch.sort_unstable();
                category_p95[category][priority] = percentile(&scratch, 95.0);
                merged.extend_from_slice(&scratch);
            }
            merged.sort_unstable();

            let c = &self.priorities[priority];
            PriorityStats {
                enqueued: c.enqueued.load(Ordering::Relaxed),
                dispatched: c.dispatched.load(Ordering::Relaxed),
                late: c.late.load(Ordering::Relaxed),
                evicted: c.evicted.load(Ordering::Relaxed),
                expired: c.expired.load(Ordering::Relaxed),
                dropped_on_shutdown: c.dropped_on_shutdown.load(Ordering::Relaxed),
                rejected_full: c.rejected_full.load(Ordering::Relaxed),
                rejected_closed: c.rejected_closed.load(Ordering::Relaxed),
                rejected_oversized: c.rejected_oversized.load(Ordering::Relaxed),
                p50: percentile(&merged, 50.0),
                p95: percentile(&merged, 95.0),
                p99: percentile(&merged, 99.0),
                max: merged.last().map(|micros| Duration::from_micros(*micros)),
                queue_depth: Category::ALL
                    .iter()
                    .map(|category| occupancy.depth[*category][priority])
                    .sum(),
                lane_capacity: occupancy.capacity[priority],
            }
        });

        let categories = CategoryTable::from_fn(|category| {
            let c = &self.categories[category];
            let batches = c.batches_formed.load(Ordering::Relaxed);
            let events = c.batched_events.load(Ordering::Relaxed);
            CategoryStats {
                queue_depth: occupancy.depth[category].clone(),
                p95: category_p95[category].clone(),
                batches_formed: batches,
                average_batch_size: if batches == 0 {
                    0.0
                } else {
                    events as f64 / batches as f64
                },
            }
        });

        let acquisitions = self.lock_acquisitions.load(Ordering::Relaxed);
        let contended = self.lock_contended.load(Ordering::Relaxed);

        MetricsSnapshot {
            events_per_sec: f64::from_bits(self.events_per_sec_bits.load(Ordering::Relaxed)),
            enqueued_total: priorities.iter().map(|(_, s)| s.enqueued).sum(),
            dispatched_total: priorities.iter().map(|(_, s)| s.dispatched).sum(),
            dropped_total: priorities.iter().map(|(_, s)| s.dropped()).sum(),
            contention_ratio: if acquisitions == 0 {
                0.0
            } else {
                contended as f64 / acquisitions as f64
            },
            advisories_emitted: self.advisories_emitted.load(Ordering::Relaxed),
            advisories_dropped: self.advisories_dropped.load(Ordering::Relaxed),
            max_tick_duration: Duration::from_micros(self.max_tick_micros.load(Ordering::Relaxed)),
            priorities,
            categories,
        }
    }

    /// Raise advisories for the state captured in `snapshot`. Called once per control tick.
    ///
    /// `LatencyBreach` fires each time the Critical p95 has been over target for
    /// `alert_consecutive_ticks` ticks in a row. Ticks without new Critical deliveries neither
    /// extend nor reset the streak. `QueueBacklog` fires when a lane crosses the
    /// occupancy threshold and re-arms once it falls back below.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) {
        // The ring keeps old samples when Critical traffic stops; only fresh ticks count.
        let dispatched = snapshot.priorities[Priority::Critical].dispatched;
        let fresh = self.breach_dispatched.swap(dispatched, Ordering::Relaxed) != dispatched;
        match snapshot.p95(Priority::Critical) {
            Some(_) if !fresh => {}
            Some(p95) if p95 > self.alerts.critical_target => {
                let streak = self.breach_streak.fetch_add(1, Ordering::Relaxed) + 1;
                if streak >= self.alerts.consecutive_ticks {
                    self.breach_streak.store(0, Ordering::Relaxed);
                    self.emit(Advisory::new(
                        AdvisoryKind::LatencyBreach,
                        None,
                        Some(Priority::Critical),
                        p95.as_micros() as f64,
                    ));
                }
            }
            _ => self.breach_streak.store(0, Ordering::Relaxed),
        }

        for category in Category::ALL {
            for priority in Priority::ALL {
                let depth = snapshot.queue_depth(category, priority);
                let capacity = snapshot.priorities[priority].lane_capacity;
                let over = capacity > 0
                    && depth as f64 > capacity as f64 * self.alerts.backlog_fraction;
                let flag = &self.backlog_flags[category][priority];
                if over && !flag.swap(true, Ordering::Relaxed) {
                    self.emit(Advisory::new(
                        AdvisoryKind::QueueBacklog,
                        Some(category),
                        Some(priority),
                        depth as f64,
                    ));
                } else if !over {
                    flag.store(false, Ordering::Relaxed);
                }
            }
        }
    }

    fn emit(&self, advisory: Advisory) {
        match self.advisory_tx.try_send(advisory) {
            Ok(()) => {
                self.advisories_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.advisories_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
