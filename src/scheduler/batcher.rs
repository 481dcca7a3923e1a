//! Adaptive Batcher: per-category batch sizing driven by observed latency.
//!
//! The batcher has two halves that run on different threads:
//!
//! * [`BatchController`] runs on the control tick. It owns the [`TuningState`] (current
//!   parameters plus a rolling window of [`ControlSample`]s) and applies a proportional rule to
//!   every category's Normal/Low latency error.
//! * [`BatchFormer`] runs inside dispatch ticks. It reads the parameters the controller last
//!   published through [`BatchParams`] (plain atomics) and pops ready batches from the lanes.
//!
//! The controller never fails: when no fresh measurements are available for a category it keeps
//! the last parameters unchanged.

use crate::config::{IntervalRange, SchedulerConfig, SizeRange};
use crate::event::Batch;
use crate::metrics::{MetricsSnapshot, PerformanceMonitor};
use crate::priority::{Category, CategoryTable, Priority, PriorityTable};
use crate::scheduler::lanes::LaneSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Number of control samples retained per category.
pub const CONTROL_WINDOW: usize = 32;

/// Batch parameters published by the controller and read by dispatch workers.
#[derive(Debug)]
pub struct BatchParams {
    batch_size: CategoryTable<AtomicUsize>,
    flush_interval_us: CategoryTable<AtomicU64>,
}

impl BatchParams {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            batch_size: CategoryTable::from_fn(|c| AtomicUsize::new(config.initial_batch_size(c))),
            flush_interval_us: CategoryTable::from_fn(|c| {
                AtomicU64::new(config.initial_flush_interval(c).as_micros() as u64)
            }),
        }
    }

    pub fn batch_size(&self, category: Category) -> usize {
        self.batch_size[category].load(Ordering::Relaxed).max(1)
    }

    pub fn flush_interval(&self, category: Category) -> Duration {
        Duration::from_micros(self.flush_interval_us[category].load(Ordering::Relaxed))
    }

    fn publish(&self, category: Category, batch_size: usize, flush_interval: Duration) {
        self.batch_size[category].store(batch_size, Ordering::Relaxed);
        self.flush_interval_us[category]
            .store(flush_interval.as_micros() as u64, Ordering::Relaxed);
    }
}

/// One observation fed to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSample {
    /// Worst Normal/Low p95 latency of the category.
    pub p95: Option<Duration>,
    /// Normal + Low depth of the category.
    pub depth: usize,
    /// Global delivered events/sec at sampling time.
    pub throughput: f64,
    /// Relative latency error, `None` when no priority had samples.
    pub error: Option<f64>,
}

/// What a control tick decided for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// No fresh data, or error inside the dead band.
    Hold,
    /// Latency over target: smaller batches, shorter flush window.
    Shrink,
    /// Latency comfortably under target with a backlog: larger batches.
    Grow,
}

#[derive(Debug, Clone)]
struct CategoryTuning {
    batch_size: usize,
    flush_interval: Duration,
    window: VecDeque<ControlSample>,
    /// Batches formed as of the previous tick, used to detect stale latency windows.
    last_batches_formed: u64,
}

/// Controller state owned exclusively by the control-tick thread.
#[derive(Debug, Clone)]
pub struct TuningState {
    categories: CategoryTable<CategoryTuning>,
}

impl TuningState {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            categories: CategoryTable::from_fn(|category| CategoryTuning {
                batch_size: config.initial_batch_size(category),
                flush_interval: config.initial_flush_interval(category),
                window: VecDeque::with_capacity(CONTROL_WINDOW),
                last_batches_formed: 0,
            }),
        }
    }

    pub fn batch_size(&self, category: Category) -> usize {
        self.categories[category].batch_size
    }

    pub fn flush_interval(&self, category: Category) -> Duration {
        self.categories[category].flush_interval
    }

    /// Recent samples for a category, oldest first.
    pub fn samples(&self, category: Category) -> impl Iterator<Item = &ControlSample> {
        self.categories[category].window.iter()
    }
}

/// Proportional controller for batch size and flush interval.
pub struct BatchController {
    state: TuningState,
    params: Arc<BatchParams>,
    size_range: CategoryTable<SizeRange>,
    interval_range: CategoryTable<IntervalRange>,
    target_latency: PriorityTable<Duration>,
    lane_capacity: PriorityTable<usize>,
    size_step: usize,
    interval_step: Duration,
    shrink_threshold: f64,
    grow_threshold: f64,
    high_water_fraction: f64,
}

impl BatchController {
    /// Create a controller and publish its initial parameters.
    pub fn new(config: &SchedulerConfig, params: Arc<BatchParams>) -> Self {
        let state = TuningState::new(config);
        for category in Category::ALL {
            params.publish(
                category,
                state.batch_size(category),
                state.flush_interval(category),
            );
        }
        Self {
            state,
            params,
            size_range: config.batch_size_range.clone(),
            interval_range: config.flush_interval_range.clone(),
            target_latency: config.target_latency.clone(),
            lane_capacity: config.lane_capacity.clone(),
            size_step: config.batch_size_step,
            interval_step: config.flush_interval_step,
            shrink_threshold: config.shrink_threshold,
            grow_threshold: config.grow_threshold,
            high_water_fraction: config.high_water_fraction,
        }
    }

    pub fn state(&self) -> &TuningState {
        &self.state
    }

    /// Run one control step. `None` means metrics were unavailable: everything is held.
    pub fn control_tick(
        &mut self,
        snapshot: Option<&MetricsSnapshot>,
    ) -> CategoryTable<Adjustment> {
        let Some(snapshot) = snapshot else {
            return CategoryTable::from_fn(|_| Adjustment::Hold);
        };
        CategoryTable::from_fn(|category| self.tune(category, snapshot))
    }

    fn tune(&mut self, category: Category, snapshot: &MetricsSnapshot) -> Adjustment {
        let (p95, error) = self.latency_error(category, snapshot);
        let depth: usize = Priority::BATCHED
            .iter()
            .map(|p| snapshot.queue_depth(category, *p))
            .sum();
        let high_water = Priority::BATCHED
            .iter()
            .map(|p| self.lane_capacity[*p] as f64)
            .sum::<f64>()
            * self.high_water_fraction;

        let tuning = &mut self.state.categories[category];
        // The latency window keeps old samples when traffic stops; only act on fresh ones.
        let batches_formed = snapshot.categories[category].batches_formed;
        let fresh = batches_formed != tuning.last_batches_formed || depth > 0;
        tuning.last_batches_formed = batches_formed;

        if tuning.window.len() == CONTROL_WINDOW {
            tuning.window.pop_front();
        }
        tuning.window.push_back(ControlSample {
            p95,
            depth,
            throughput: snapshot.events_per_sec,
            error,
        });

        let Some(error) = error.filter(|_| fresh) else {
            return Adjustment::Hold;
        };

        let size_range = self.size_range[category];
        let interval_range = self.interval_range[category];
        let (batch_size, flush_interval, adjustment) = if error > self.shrink_threshold {
            (
                size_range.clamp(tuning.batch_size.saturating_sub(self.size_step)),
                interval_range.clamp(tuning.flush_interval.saturating_sub(self.interval_step)),
                Adjustment::Shrink,
            )
        } else if error < self.grow_threshold && depth as f64 > high_water {
            (
                size_range.clamp(tuning.batch_size.saturating_add(self.size_step)),
                interval_range.clamp(tuning.flush_interval.saturating_add(self.interval_step)),
                Adjustment::Grow,
            )
        } else {
            return Adjustment::Hold;
        };

        if batch_size != tuning.batch_size || flush_interval != tuning.flush_interval {
            debug!(
                %category,
                error,
                depth,
                from = tuning.batch_size,
                to = batch_size,
                flush_us = flush_interval.as_micros() as u64,
                "batch parameters retuned"
            );
        }
        tuning.batch_size = batch_size;
        tuning.flush_interval = flush_interval;
        self.params.publish(category, batch_size, flush_interval);
        adjustment
    }

    /// Worst relative error over the batched priorities that have samples.
    fn latency_error(
        &self,
        category: Category,
        snapshot: &MetricsSnapshot,
    ) -> (Option<Duration>, Option<f64>) {
        let mut worst_p95: Option<Duration> = None;
        let mut worst_error: Option<f64> = None;
        for priority in Priority::BATCHED {
            let Some(p95) = snapshot.category_p95(category, priority) else {
                continue;
            };
            let target = self.target_latency[priority].as_secs_f64();
            let error = (p95.as_secs_f64() - target) / target;
            worst_p95 = worst_p95.max(Some(p95));
            worst_error = Some(worst_error.map_or(error, |e: f64| e.max(error)));
        }
        (worst_p95, worst_error)
    }
}

/// Pops ready Normal/Low batches out of the lanes.
pub struct BatchFormer {
    params: Arc<BatchParams>,
    monitor: Arc<PerformanceMonitor>,
    max_batches_per_tick: usize,
    max_event_age: PriorityTable<Option<Duration>>,
}

impl BatchFormer {
    pub fn new(
        config: &SchedulerConfig,
        params: Arc<BatchParams>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            params,
            monitor,
            max_batches_per_tick: config.max_batches_per_tick,
            max_event_age: config.max_event_age.clone(),
        }
    }

    /// Form up to `budget` batches from one lane.
    ///
    /// A lane is ready when it holds a full batch, when its oldest event has waited for the
    /// flush interval, or unconditionally while draining. Empty lanes never yield a batch.
    pub fn form(
        &self,
        lanes: &LaneSet,
        category: Category,
        priority: Priority,
        now: Instant,
        draining: bool,
        budget: usize,
    ) -> Vec<Batch> {
        debug_assert!(priority.is_batched());
        if let Some(max_age) = self.max_event_age[priority] {
            lanes.expire(category, priority, max_age, now);
        }

        let batch_size = self.params.batch_size(category);
        let flush_interval = self.params.flush_interval(category);
        let mut batches = Vec::new();
        while batches.len() < self.max_batches_per_tick.min(budget) {
            let depth = lanes.depth(category, priority);
            if depth == 0 {
                break;
            }
            let ready = draining
                || depth >= batch_size
                || lanes
                    .oldest_enqueued_at(category, priority)
                    .is_some_and(|at| now.saturating_duration_since(at) >= flush_interval);
            if !ready {
                break;
            }
            let events = lanes.drain_lane(category, priority, batch_size);
            if events.is_empty() {
                break;
            }
            self.monitor.record_batch(category, events.len());
            batches.push(Batch {
                category,
                priority,
                formed_at: now,
                events,
            });
        }
        batches
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::LaneOccupancy;

    fn monitor() -> Arc<PerformanceMonitor> {
        let (tx, _rx) = crossbeam_channel::bounded(16);
        Arc::new(PerformanceMonitor::new(&SchedulerConfig::default(), tx))
    }

    /// Snapshot where `category`'s Normal p95 is `p95` and its Normal depth is `depth`.
    fn snapshot_with(category: Category, p95: Duration, depth: usize, batches: u64) -> MetricsSnapshot {
        let monitor = monitor();
        let mut occupancy = LaneOccupancy::empty(SchedulerConfig::default().lane_capacity);
        occupancy.depth[category][Priority::Normal] = depth;
        let mut snapshot = monitor.snapshot(&occupancy);
        snapshot.categories[category].p95[Priority::Normal] = Some(p95);
        snapshot.categories[category].batches_formed = batches;
        snapshot
    }

    fn controller(config: &SchedulerConfig) -> BatchController {
        BatchController::new(config, Arc::new(BatchParams::new(config)))
    }

    #[test]
    fn test_missing_metrics_hold_parameters() {
        let config = SchedulerConfig::default();
        let mut controller = controller(&config);
        let before = controller.state().batch_size(Category::Visual);
        let actions = controller.control_tick(None);
        assert!(actions.iter().all(|(_, a)| *a == Adjustment::Hold));
        assert_eq!(controller.state().batch_size(Category::Visual), before);
    }

    #[test]
    fn test_sustained_breach_shrinks_every_tick_down_to_floor() {
        let config = SchedulerConfig::default();
        let mut controller = controller(&config);
        let target = config.target_latency[Priority::Normal];
        let over = target.mul_f64(1.5);

        let mut sizes = vec![controller.state().batch_size(Category::Visual)];
        for tick in 1..=5u64 {
            let snapshot = snapshot_with(Category::Visual, over, 10, tick);
            let actions = controller.control_tick(Some(&snapshot));
            assert_eq!(actions[Category::Visual], Adjustment::Shrink);
            sizes.push(controller.state().batch_size(Category::Visual));
        }
        assert!(sizes.windows(2).all(|w| w[1] < w[0]), "sizes: {sizes:?}");

        for tick in 6..=40u64 {
            controller.control_tick(Some(&snapshot_with(Category::Visual, over, 10, tick)));
        }
        let range = config.batch_size_range[Category::Visual];
        assert_eq!(controller.state().batch_size(Category::Visual), range.min);
        assert_eq!(
            controller.state().flush_interval(Category::Visual),
            config.flush_interval_range[Category::Visual].min
        );
        assert_eq!(controller.params.batch_size(Category::Visual), range.min);
    }

    #[test]
    fn test_grow_requires_backlog_above_high_water() {
        let config = SchedulerConfig::default();
        let mut controller = controller(&config);
        let fast = config.target_latency[Priority::Normal] / 2;
        let start = controller.state().batch_size(Category::Audio);

        let idle = snapshot_with(Category::Audio, fast, 0, 1);
        assert_eq!(controller.control_tick(Some(&idle))[Category::Audio], Adjustment::Hold);

        let backlog = config.lane_capacity[Priority::Normal];
        let busy = snapshot_with(Category::Audio, fast, backlog, 2);
        assert_eq!(controller.control_tick(Some(&busy))[Category::Audio], Adjustment::Grow);
        assert_eq!(
            controller.state().batch_size(Category::Audio),
            (start + config.batch_size_step).min(config.batch_size_range[Category::Audio].max)
        );
    }

    #[test]
    fn test_stale_latency_window_is_ignored() {
        let config = SchedulerConfig::default();
        let mut controller = controller(&config);
        let over = config.target_latency[Priority::Normal] * 2;
        let snapshot = snapshot_with(Category::Sync, over, 0, 3);
        assert_eq!(controller.control_tick(Some(&snapshot))[Category::Sync], Adjustment::Shrink);
        // Same batch count and nothing queued: the p95 is left over from earlier traffic.
        assert_eq!(controller.control_tick(Some(&snapshot))[Category::Sync], Adjustment::Hold);
        assert_eq!(controller.state().samples(Category::Sync).count(), 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let config = SchedulerConfig::default();
        let mut controller = controller(&config);
        let snapshot = snapshot_with(Category::Parameter, Duration::from_millis(1), 0, 0);
        for _ in 0..(CONTROL_WINDOW + 10) {
            controller.control_tick(Some(&snapshot));
        }
        assert_eq!(
            controller.state().samples(Category::Parameter).count(),
            CONTROL_WINDOW
        );
    }

    fn open_lanes(config: &SchedulerConfig, monitor: Arc<PerformanceMonitor>) -> LaneSet {
        let lanes = LaneSet::new(
            config.lane_capacity.clone(),
            config.target_latency.clone(),
            monitor,
        );
        lanes.open();
        lanes
    }

    #[test]
    fn test_former_waits_for_full_batch_or_flush_interval() {
        let config = SchedulerConfig::default();
        let monitor = monitor();
        let lanes = open_lanes(&config, monitor.clone());
        let params = Arc::new(BatchParams::new(&config));
        params.publish(Category::Visual, 4, Duration::from_millis(5));
        let former = BatchFormer::new(&config, params, monitor);

        let start = Instant::now();
        for i in 0..3u8 {
            lanes
                .enqueue(Category::Visual, Priority::Normal, &[i], None, start)
                .unwrap();
        }
        let formed = former.form(&lanes, Category::Visual, Priority::Normal, start, false, 8);
        assert!(formed.is_empty());

        let later = start + Duration::from_millis(5);
        let formed = former.form(&lanes, Category::Visual, Priority::Normal, later, false, 8);
        assert_eq!(formed.len(), 1);
        assert_eq!(formed[0].len(), 3);

        assert!(former
            .form(&lanes, Category::Visual, Priority::Normal, later, true, 8)
            .is_empty());
    }

    #[test]
    fn test_former_limits_batches_per_tick_and_budget() {
        let config = SchedulerConfig {
            max_batches_per_tick: 2,
            ..SchedulerConfig::default()
        };
        let monitor = monitor();
        let lanes = open_lanes(&config, monitor.clone());
        let params = Arc::new(BatchParams::new(&config));
        params.publish(Category::Audio, 2, Duration::from_secs(1));
        let former = BatchFormer::new(&config, params, monitor.clone());

        let now = Instant::now();
        for i in 0..10u8 {
            lanes
                .enqueue(Category::Audio, Priority::Low, &[i], None, now)
                .unwrap();
        }
        let formed = former.form(&lanes, Category::Audio, Priority::Low, now, false, 8);
        assert_eq!(formed.len(), 2);
        assert!(formed.iter().all(|b| b.len() == 2));
        assert_eq!(formed[0].events[0].payload().as_bytes(), &[0]);

        let formed = former.form(&lanes, Category::Audio, Priority::Low, now, true, 1);
        assert_eq!(formed.len(), 1);
        assert_eq!(lanes.depth(Category::Audio, Priority::Low), 4);

        let snapshot = monitor.snapshot(&lanes.occupancy());
        assert_eq!(snapshot.categories[Category::Audio].batches_formed, 3);
        assert_eq!(snapshot.categories[Category::Audio].average_batch_size, 2.0);
    }

    #[test]
    fn test_former_expires_old_events_first() {
        let mut config = SchedulerConfig::default();
        config.max_event_age[Priority::Low] = Some(Duration::from_millis(20));
        let monitor = monitor();
        let lanes = open_lanes(&config, monitor.clone());
        let former = BatchFormer::new(&config, Arc::new(BatchParams::new(&config)), monitor.clone());

        let start = Instant::now();
        lanes
            .enqueue(Category::UserInput, Priority::Low, &[1], None, start)
            .unwrap();
        let formed = former.form(
            &lanes,
            Category::UserInput,
            Priority::Low,
            start + Duration::from_millis(30),
            true,
            4,
        );
        assert!(formed.is_empty());
        let snapshot = monitor.snapshot(&lanes.occupancy());
        assert_eq!(snapshot.priorities[Priority::Low].expired, 1);
    }
}
