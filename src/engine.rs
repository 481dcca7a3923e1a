//! Scheduler Core: lifecycle, worker threads and the public control surface.
//!
//! The core wires the lanes, batcher, dispatcher and monitor together and owns the two cadences:
//!
//! * `dispatch_workers` dispatch threads, each ticking a fixed subset of categories every
//!   `dispatch_interval`;
//! * one control thread that samples the monitor, evaluates alerts, runs the batch controller and
//!   forwards advisories every `control_interval`.
//!
//! State machine: `Stopped -> Running -> Draining -> Stopped`. Only `Running` admits events.

use crate::config::SchedulerConfig;
use crate::error::{RejectReason, SchedulerError};
use crate::event::{Delivery, EventId};
use crate::metrics::{Advisory, AdvisoryKind, MetricsSnapshot, PerformanceMonitor};
use crate::priority::{Category, Priority};
use crate::scheduler::{
    BatchController, BatchFormer, BatchParams, ConsumerRegistry, ConsumerSettings, Dispatcher,
    LaneSet,
};
use crate::threading::ThreadPlacement;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Scheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SchedulerState {
    Stopped = 0,
    Running = 1,
    Draining = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SchedulerState::Running,
            2 => SchedulerState::Draining,
            _ => SchedulerState::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerState::Stopped => "stopped",
            SchedulerState::Running => "running",
            SchedulerState::Draining => "draining",
        }
    }
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`Scheduler::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Events delivered between the start of the drain and the stop.
    pub drained: u64,
    /// Events still resident when the drain ended, discarded.
    pub dropped_on_shutdown: u64,
    /// Whether the drain ended because the timeout elapsed.
    pub timed_out: bool,
}

/// Everything rebuilt by `configure()`.
struct Core {
    lanes: Arc<LaneSet>,
    monitor: Arc<PerformanceMonitor>,
    params: Arc<BatchParams>,
    dispatcher: Arc<Dispatcher>,
    advisory_rx: Receiver<Advisory>,
}

impl Core {
    fn build(config: &SchedulerConfig, registry: &Arc<ConsumerRegistry>) -> Self {
        let (advisory_tx, advisory_rx) = bounded(config.advisory_capacity);
        let monitor = Arc::new(PerformanceMonitor::new(config, advisory_tx));
        let lanes = Arc::new(LaneSet::new(
            config.lane_capacity.clone(),
            config.target_latency.clone(),
            monitor.clone(),
        ));
        let params = Arc::new(BatchParams::new(config));
        let former = BatchFormer::new(config, params.clone(), monitor.clone());
        registry.set_monitor(monitor.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            lanes.clone(),
            former,
            registry.clone(),
            monitor.clone(),
        ));
        Self {
            lanes,
            monitor,
            params,
            dispatcher,
            advisory_rx,
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        self.monitor.snapshot(&self.lanes.occupancy())
    }
}

type Subscribers = Arc<Mutex<Vec<Sender<Advisory>>>>;

/// Real-time event scheduler.
///
/// Share it across producer threads with `Arc<Scheduler>`; every method takes `&self`.
///
/// # Example
/// ```no_run
/// use frame_scheduler::{Category, Priority, Scheduler, SchedulerConfig};
/// use std::time::Duration;
///
/// let scheduler = Scheduler::new(SchedulerConfig::default())?;
/// scheduler.register_consumer(Category::Audio, |delivery| {
///     let _ = delivery.events().len();
/// })?;
/// scheduler.start()?;
/// scheduler.enqueue(Category::Audio, Priority::Critical, &[0x90, 60, 127], None).ok();
/// let report = scheduler.stop(Duration::from_millis(100));
/// assert!(!report.timed_out || report.dropped_on_shutdown > 0);
/// # Ok::<(), frame_scheduler::SchedulerError>(())
/// ```
pub struct Scheduler {
    config: Mutex<SchedulerConfig>,
    core: RwLock<Arc<Core>>,
    registry: Arc<ConsumerRegistry>,
    state: Arc<AtomicU8>,
    running: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    subscribers: Subscribers,
    /// Serializes start, stop and configure.
    lifecycle: Mutex<()>,
}

impl Scheduler {
    /// Build a stopped scheduler from a validated configuration.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let registry = Arc::new(ConsumerRegistry::new());
        let core = Core::build(&config, &registry);
        Ok(Self {
            config: Mutex::new(config),
            core: RwLock::new(Arc::new(core)),
            registry,
            state: Arc::new(AtomicU8::new(SchedulerState::Stopped as u8)),
            running: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SchedulerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn config(&self) -> SchedulerConfig {
        self.config.lock().clone()
    }

    /// Replace the configuration. Only allowed while stopped.
    ///
    /// Lanes, counters and tuning are rebuilt from the new values; registered consumers stay
    /// attached (the new hand-off capacity applies to consumers registered afterwards).
    pub fn configure(&self, config: SchedulerConfig) -> Result<(), SchedulerError> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state != SchedulerState::Stopped {
            return Err(SchedulerError::NotStopped(state.as_str()));
        }
        config.validate()?;
        let core = Core::build(&config, &self.registry);
        *self.core.write() = Arc::new(core);
        *self.config.lock() = config;
        info!("scheduler reconfigured");
        Ok(())
    }

    /// Open the lanes and spawn the dispatch and control threads.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let _lifecycle = self.lifecycle.lock();
        let state = self.state();
        if state != SchedulerState::Stopped {
            return Err(SchedulerError::NotStopped(state.as_str()));
        }
        let config = self.config();
        let core = self.core.read().clone();

        // Tuning state lives for exactly one run.
        let controller = BatchController::new(&config, core.params.clone());

        self.running.store(true, Ordering::Release);
        core.lanes.open();
        self.set_state(SchedulerState::Running);

        match self.spawn_workers(&config, &core, controller) {
            Ok(handles) => {
                *self.workers.lock() = handles;
                info!(
                    dispatch_workers = config.dispatch_workers,
                    dispatch_interval_us = config.dispatch_interval.as_micros() as u64,
                    control_interval_us = config.control_interval.as_micros() as u64,
                    "scheduler started"
                );
                Ok(())
            }
            Err((handles, err)) => {
                self.running.store(false, Ordering::Release);
                core.lanes.close();
                for handle in handles {
                    let _ = handle.join();
                }
                self.set_state(SchedulerState::Stopped);
                Err(err)
            }
        }
    }

    fn spawn_workers(
        &self,
        config: &SchedulerConfig,
        core: &Arc<Core>,
        controller: BatchController,
    ) -> Result<Vec<JoinHandle<()>>, (Vec<JoinHandle<()>>, SchedulerError)> {
        let mut handles = Vec::with_capacity(config.dispatch_workers + 1);
        let workers = config.dispatch_workers.max(1);

        for worker_id in 0..workers {
            let owned: Vec<Category> = Category::ALL
                .into_iter()
                .filter(|category| category.index() % workers == worker_id)
                .collect();
            let dispatcher = core.dispatcher.clone();
            let running = self.running.clone();
            let state = self.state.clone();
            let interval = config.dispatch_interval;
            let placement = ThreadPlacement::for_worker(
                worker_id,
                &config.worker_cores,
                config.worker_thread_priority,
            );
            let spawned = thread::Builder::new()
                .name(format!("dispatch-{worker_id}"))
                .spawn(move || {
                    placement.apply();
                    run_dispatch_loop(&dispatcher, &owned, &running, &state, interval);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => return Err((handles, SchedulerError::Spawn(err))),
            }
        }

        let core = core.clone();
        let running = self.running.clone();
        let subscribers = self.subscribers.clone();
        let interval = config.control_interval;
        let placement = ThreadPlacement::for_worker(workers, &config.worker_cores, None);
        let spawned = thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                placement.apply();
                run_control_loop(&core, controller, &running, &subscribers, interval);
            });
        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => return Err((handles, SchedulerError::Spawn(err))),
        }
        Ok(handles)
    }

    /// Drain and stop.
    ///
    /// Intake is closed immediately. Dispatch keeps running (flushing partial batches) until the
    /// lanes are empty or `timeout` elapses; whatever is still resident then is discarded and
    /// counted as dropped on shutdown. Stopping a scheduler that is not running is a no-op.
    pub fn stop(&self, timeout: Duration) -> ShutdownReport {
        let _lifecycle = self.lifecycle.lock();
        if self.state() != SchedulerState::Running {
            return ShutdownReport::default();
        }
        let core = self.core.read().clone();
        let dispatched_before = core.monitor.dispatched_total();

        self.set_state(SchedulerState::Draining);
        core.lanes.close();
        info!(
            resident = core.lanes.resident(),
            timeout_ms = timeout.as_millis() as u64,
            "scheduler draining"
        );

        let poll = self.config.lock().dispatch_interval;
        let deadline = Instant::now() + timeout;
        let timed_out = loop {
            if core.lanes.is_empty() {
                break false;
            }
            let now = Instant::now();
            if now >= deadline {
                break true;
            }
            thread::sleep(poll.min(deadline - now));
        };

        self.running.store(false, Ordering::Release);
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                warn!("scheduler worker thread panicked");
            }
        }

        let dropped = core.lanes.clear();
        let dropped_on_shutdown: u64 = dropped.iter().map(|(_, count)| *count).sum();
        if dropped_on_shutdown > 0 {
            warn!(
                dropped_on_shutdown,
                critical = dropped[Priority::Critical],
                high = dropped[Priority::High],
                normal = dropped[Priority::Normal],
                low = dropped[Priority::Low],
                "events discarded at shutdown"
            );
        }
        forward_advisories(&core.advisory_rx, &self.subscribers);
        self.set_state(SchedulerState::Stopped);

        let report = ShutdownReport {
            drained: core.monitor.dispatched_total() - dispatched_before,
            dropped_on_shutdown,
            timed_out,
        };
        info!(
            drained = report.drained,
            dropped_on_shutdown = report.dropped_on_shutdown,
            timed_out = report.timed_out,
            "scheduler stopped"
        );
        report
    }

    /// Submit an event. Never blocks beyond a lane's short critical section.
    pub fn enqueue(
        &self,
        category: Category,
        priority: Priority,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> Result<EventId, RejectReason> {
        self.core
            .read()
            .lanes
            .enqueue(category, priority, payload, deadline, Instant::now())
    }

    /// Attach the consumer for `category`. The handler runs on a dedicated delivery thread and
    /// should return quickly; slow calls raise `WorkerStall` advisories.
    pub fn register_consumer<F>(&self, category: Category, handler: F) -> Result<(), SchedulerError>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let settings = {
            let config = self.config.lock();
            ConsumerSettings {
                handoff_capacity: config.handoff_capacity,
                stall_threshold: config.handler_stall_threshold,
                strict: config.strict_consumer_registration,
            }
        };
        self.registry.register(category, settings, handler)
    }

    /// Remove the consumer of `category`. Its events stay queued until a new one registers.
    pub fn detach_consumer(&self, category: Category) -> bool {
        self.registry.detach(category)
    }

    /// Point-in-time copy of the metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.core.read().snapshot()
    }

    /// Alias of [`Scheduler::snapshot`].
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.snapshot()
    }

    /// Receive advisories as the control thread forwards them. Slow receivers lose records.
    pub fn subscribe_advisories(&self) -> Receiver<Advisory> {
        let capacity = self.config.lock().advisory_capacity;
        let (tx, rx) = bounded(capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Current published batch size of a category.
    pub fn batch_size(&self, category: Category) -> usize {
        self.core.read().params.batch_size(category)
    }

    /// Current published flush interval of a category.
    pub fn flush_interval(&self, category: Category) -> Duration {
        self.core.read().params.flush_interval(category)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if self.state() == SchedulerState::Running {
            self.stop(Duration::ZERO);
        }
    }
}

fn run_dispatch_loop(
    dispatcher: &Dispatcher,
    categories: &[Category],
    running: &AtomicBool,
    state: &AtomicU8,
    interval: Duration,
) {
    debug!(?categories, "dispatch worker started");
    while running.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        let draining = SchedulerState::from_u8(state.load(Ordering::Acquire))
            == SchedulerState::Draining;
        dispatcher.tick_categories(categories, tick_start, draining);
        sleep_remaining(tick_start, interval);
    }
}

fn run_control_loop(
    core: &Core,
    mut controller: BatchController,
    running: &AtomicBool,
    subscribers: &Subscribers,
    interval: Duration,
) {
    debug!("control loop started");
    while running.load(Ordering::Acquire) {
        let tick_start = Instant::now();
        core.monitor.sample_throughput(tick_start);
        let snapshot = core.snapshot();
        core.monitor.evaluate(&snapshot);
        controller.control_tick(Some(&snapshot));
        forward_advisories(&core.advisory_rx, subscribers);
        sleep_remaining(tick_start, interval);
    }
    // `controller` and its tuning state are dropped here.
}

fn sleep_remaining(tick_start: Instant, interval: Duration) {
    let elapsed = tick_start.elapsed();
    if elapsed < interval {
        thread::sleep(interval - elapsed);
    }
}

/// Log pending advisories and fan them out to subscribers, pruning disconnected ones.
fn forward_advisories(rx: &Receiver<Advisory>, subscribers: &Subscribers) {
    for advisory in rx.try_iter() {
        match advisory.kind {
            AdvisoryKind::QueueBacklog => warn!(
                category = ?advisory.category,
                priority = ?advisory.priority,
                depth = advisory.value,
                "queue backlog"
            ),
            AdvisoryKind::LatencyBreach => warn!(
                p95_us = advisory.value,
                "critical latency above target"
            ),
            AdvisoryKind::WorkerStall => warn!(
                category = ?advisory.category,
                value = advisory.value,
                "consumer stalled"
            ),
        }
        subscribers.lock().retain(|tx| {
            !matches!(
                tx.try_send(advisory.clone()),
                Err(TrySendError::Disconnected(_))
            )
        });
    }
}
