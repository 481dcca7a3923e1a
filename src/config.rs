//! Scheduler configuration.
//!
//! One explicit, validated struct replaces ad-hoc queue and priority knobs. Values are checked
//! against declared ranges when the scheduler is built, reconfigured, or started.

use crate::error::ConfigError;
use crate::priority::{Category, CategoryTable, Priority, PriorityTable};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Duration of one frame at 60 Hz.
pub const FRAME_60HZ: Duration = Duration::from_micros(16_667);

const MAX_LANE_CAPACITY: usize = 1 << 20;
const MAX_BATCH_SIZE: usize = 4096;

/// Inclusive batch size bounds for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: usize,
    pub max: usize,
}

impl SizeRange {
    pub const fn new(min: usize, max: usize) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: usize) -> usize {
        value.clamp(self.min, self.max)
    }
}

/// Inclusive flush interval bounds for one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalRange {
    pub min: Duration,
    pub max: Duration,
}

impl IntervalRange {
    pub const fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn clamp(&self, value: Duration) -> Duration {
        value.clamp(self.min, self.max)
    }
}

/// Complete scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Capacity of each category's lane, per priority.
    pub lane_capacity: PriorityTable<usize>,
    /// Batch size bounds per category.
    pub batch_size_range: CategoryTable<SizeRange>,
    /// Flush interval bounds per category.
    pub flush_interval_range: CategoryTable<IntervalRange>,
    /// Latency target per priority (hard deadline default for Critical/High).
    pub target_latency: PriorityTable<Duration>,

    /// Period of the dispatch tick.
    pub dispatch_interval: Duration,
    /// Period of the batching control tick.
    pub control_interval: Duration,
    /// Number of dispatch worker threads; each owns a fixed subset of categories.
    pub dispatch_workers: usize,

    /// Fixed step applied to batch sizes by the controller.
    pub batch_size_step: usize,
    /// Fixed step applied to flush intervals by the controller.
    pub flush_interval_step: Duration,
    /// Relative latency error above which batches shrink.
    pub shrink_threshold: f64,
    /// Relative latency error below which batches may grow (negative).
    pub grow_threshold: f64,
    /// Fraction of lane capacity the queue depth must exceed before batches grow.
    pub high_water_fraction: f64,
    /// Upper bound on batches emitted per lane in one dispatch tick.
    pub max_batches_per_tick: usize,
    /// Optional age limit for Normal/Low events; Critical/High entries are ignored.
    pub max_event_age: PriorityTable<Option<Duration>>,

    /// Pending deliveries buffered per consumer before its category is skipped.
    pub handoff_capacity: usize,
    /// A single handler call longer than this raises a `WorkerStall` advisory.
    pub handler_stall_threshold: Duration,
    /// Latency samples kept per (category, priority).
    pub latency_window: usize,
    /// Consecutive control ticks with Critical p95 over target before `LatencyBreach` fires.
    pub alert_consecutive_ticks: u32,
    /// Lane occupancy fraction that raises `QueueBacklog`.
    pub backlog_alert_fraction: f64,
    /// Capacity of the advisory channel.
    pub advisory_capacity: usize,

    /// Refuse a second consumer registration for a category instead of replacing it.
    pub strict_consumer_registration: bool,
    /// Cores the worker threads are pinned to (round-robin). Empty disables pinning.
    pub worker_cores: Vec<usize>,
    /// Cooperative thread priority for worker threads (see `threading`).
    pub worker_thread_priority: Option<i32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lane_capacity: PriorityTable::from_fn(|priority| match priority {
                Priority::Critical => 1024,
                Priority::High => 4096,
                Priority::Normal | Priority::Low => 16_384,
            }),
            batch_size_range: CategoryTable::from_fn(|category| match category {
                Category::Audio => SizeRange::new(1, 32),
                Category::Visual => SizeRange::new(1, 64),
                Category::Parameter => SizeRange::new(1, 128),
                Category::Sync => SizeRange::new(1, 8),
                Category::UserInput => SizeRange::new(1, 16),
            }),
            flush_interval_range: CategoryTable::from_fn(|category| match category {
                Category::Audio => {
                    IntervalRange::new(Duration::from_micros(500), Duration::from_millis(5))
                }
                Category::Visual | Category::Parameter => {
                    IntervalRange::new(Duration::from_millis(1), FRAME_60HZ)
                }
                Category::Sync => {
                    IntervalRange::new(Duration::from_micros(250), Duration::from_millis(2))
                }
                Category::UserInput => {
                    IntervalRange::new(Duration::from_micros(500), Duration::from_millis(8))
                }
            }),
            target_latency: PriorityTable::from_fn(|priority| match priority {
                Priority::Critical => Duration::from_millis(1),
                Priority::High => Duration::from_millis(5),
                Priority::Normal => FRAME_60HZ,
                Priority::Low => Duration::from_millis(100),
            }),
            dispatch_interval: Duration::from_millis(1),
            control_interval: FRAME_60HZ,
            dispatch_workers: 1,
            batch_size_step: 4,
            flush_interval_step: Duration::from_millis(1),
            shrink_threshold: 0.1,
            grow_threshold: -0.2,
            high_water_fraction: 0.25,
            max_batches_per_tick: 4,
            max_event_age: PriorityTable::from_fn(|_| None),
            handoff_capacity: 1024,
            handler_stall_threshold: Duration::from_millis(5),
            latency_window: 1024,
            alert_consecutive_ticks: 3,
            backlog_alert_fraction: 0.9,
            advisory_capacity: 1024,
            strict_consumer_registration: false,
            worker_cores: Vec::new(),
            worker_thread_priority: None,
        }
    }
}

fn check_range(field: &str, value: u128, min: u128, max: u128) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_ratio(field: &str, value: f64, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(ConfigError::OutOfRangeRatio {
            field: field.to_string(),
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn check_ordered(field: &str, min: u128, max: u128) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::InvalidRange {
            field: field.to_string(),
            min,
            max,
        });
    }
    Ok(())
}

impl SchedulerConfig {
    /// Parse a JSON document; omitted fields take their defaults. The result is validated.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SchedulerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check every value against its declared range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (priority, capacity) in self.lane_capacity.iter() {
            check_range(
                &format!("lane_capacity.{priority}"),
                *capacity as u128,
                1,
                MAX_LANE_CAPACITY as u128,
            )?;
        }
        for (category, range) in self.batch_size_range.iter() {
            let field = format!("batch_size_range.{category}");
            check_range(&field, range.min as u128, 1, MAX_BATCH_SIZE as u128)?;
            check_range(&field, range.max as u128, 1, MAX_BATCH_SIZE as u128)?;
            check_ordered(&field, range.min as u128, range.max as u128)?;
        }
        for (category, range) in self.flush_interval_range.iter() {
            let field = format!("flush_interval_range.{category}");
            check_range(&field, range.min.as_micros(), 50, 10_000_000)?;
            check_range(&field, range.max.as_micros(), 50, 10_000_000)?;
            check_ordered(&field, range.min.as_micros(), range.max.as_micros())?;
        }
        for (priority, target) in self.target_latency.iter() {
            check_range(
                &format!("target_latency.{priority}"),
                target.as_micros(),
                50,
                60_000_000,
            )?;
        }
        check_range(
            "dispatch_interval",
            self.dispatch_interval.as_micros(),
            50,
            100_000,
        )?;
        check_range(
            "control_interval",
            self.control_interval.as_micros(),
            1_000,
            10_000_000,
        )?;
        check_range(
            "dispatch_workers",
            self.dispatch_workers as u128,
            1,
            Category::ALL.len() as u128,
        )?;
        check_range("batch_size_step", self.batch_size_step as u128, 1, 1024)?;
        check_range(
            "flush_interval_step",
            self.flush_interval_step.as_micros(),
            1,
            1_000_000,
        )?;
        check_ratio("shrink_threshold", self.shrink_threshold, 0.0, 10.0)?;
        check_ratio("grow_threshold", self.grow_threshold, -1.0, 0.0)?;
        check_ratio("high_water_fraction", self.high_water_fraction, 0.0, 1.0)?;
        check_range(
            "max_batches_per_tick",
            self.max_batches_per_tick as u128,
            1,
            64,
        )?;
        for priority in Priority::BATCHED {
            if let Some(age) = self.max_event_age[priority] {
                check_range(
                    &format!("max_event_age.{priority}"),
                    age.as_micros(),
                    1_000,
                    3_600_000_000,
                )?;
            }
        }
        check_range("handoff_capacity", self.handoff_capacity as u128, 1, 65_536)?;
        check_range(
            "handler_stall_threshold",
            self.handler_stall_threshold.as_micros(),
            100,
            60_000_000,
        )?;
        check_range("latency_window", self.latency_window as u128, 16, 65_536)?;
        check_range(
            "alert_consecutive_ticks",
            self.alert_consecutive_ticks as u128,
            1,
            10_000,
        )?;
        check_ratio("backlog_alert_fraction", self.backlog_alert_fraction, 0.0, 1.0)?;
        check_range("advisory_capacity", self.advisory_capacity as u128, 1, 1 << 20)?;
        Ok(())
    }

    /// Batch size a category starts with: the midpoint of its range.
    pub fn initial_batch_size(&self, category: Category) -> usize {
        let range = self.batch_size_range[category];
        range.min + (range.max - range.min) / 2
    }

    /// Flush interval a category starts with: the midpoint of its range.
    pub fn initial_flush_interval(&self, category: Category) -> Duration {
        let range = self.flush_interval_range[category];
        range.min + (range.max - range.min) / 2
    }
}
