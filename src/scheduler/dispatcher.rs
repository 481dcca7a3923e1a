//! Deadline Dispatcher: delivers relayed events and formed batches to per-category consumers.
//!
//! Handlers never run on a dispatch thread. Every registered consumer owns a delivery worker
//! thread fed by a bounded hand-off queue; the dispatcher only `try_send`s into that queue, and
//! the queue's free space is the delivery budget for that category in a tick. A consumer that
//! blocks therefore costs the dispatcher at most one skipped category per tick, never a stalled
//! tick.

use crate::error::SchedulerError;
use crate::event::{DeliveredEvent, Delivery};
use crate::metrics::PerformanceMonitor;
use crate::priority::{Category, CategoryTable, Priority};
use crate::scheduler::batcher::BatchFormer;
use crate::scheduler::lanes::LaneSet;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Consumer side of one category's hand-off queue.
struct ConsumerSlot {
    tx: Sender<Delivery>,
    /// Set while the hand-off queue is full, so a stall is reported once per episode.
    stalled: Arc<AtomicBool>,
}

/// Settings applied to consumers registered from now on.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerSettings {
    pub handoff_capacity: usize,
    pub stall_threshold: Duration,
    pub strict: bool,
}

/// Registered consumers, one per category at most.
///
/// The registry outlives reconfiguration of the scheduler, so handlers stay registered when the
/// lanes and monitor are rebuilt; [`ConsumerRegistry::set_monitor`] redirects stall reports.
pub struct ConsumerRegistry {
    slots: CategoryTable<Mutex<Option<ConsumerSlot>>>,
    monitor: StallSink,
}

type StallSink = Arc<RwLock<Option<Arc<PerformanceMonitor>>>>;

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self {
            slots: CategoryTable::from_fn(|_| Mutex::new(None)),
            monitor: Arc::new(RwLock::new(None)),
        }
    }

    /// Route slow-handler reports of every delivery worker to `monitor`.
    pub fn set_monitor(&self, monitor: Arc<PerformanceMonitor>) {
        *self.monitor.write() = Some(monitor);
    }

    /// Attach `handler` to `category`, spawning its delivery worker.
    ///
    /// The previous consumer, if any, is detached: its worker finishes the deliveries already
    /// handed to it and exits. In strict mode a second registration is refused instead.
    pub fn register<F>(
        &self,
        category: Category,
        settings: ConsumerSettings,
        handler: F,
    ) -> Result<(), SchedulerError>
    where
        F: FnMut(Delivery) + Send + 'static,
    {
        let mut slot = self.slots[category].lock();
        if settings.strict && slot.is_some() {
            return Err(SchedulerError::ConsumerConflict(category));
        }

        let (tx, rx) = bounded(settings.handoff_capacity);
        let monitor = self.monitor.clone();
        thread::Builder::new()
            .name(format!("deliver-{category}"))
            .spawn(move || run_delivery_worker(category, rx, handler, monitor, settings.stall_threshold))
            .map_err(SchedulerError::Spawn)?;

        let replaced = slot
            .replace(ConsumerSlot {
                tx,
                stalled: Arc::new(AtomicBool::new(false)),
            })
            .is_some();
        info!(%category, replaced, "consumer registered");
        Ok(())
    }

    /// Remove the consumer of `category`. Returns whether one was registered.
    pub fn detach(&self, category: Category) -> bool {
        let detached = self.slots[category].lock().take().is_some();
        if detached {
            info!(%category, "consumer detached");
        }
        detached
    }

    pub fn is_registered(&self, category: Category) -> bool {
        self.slots[category].lock().is_some()
    }

    fn handoff(&self, category: Category) -> Option<(Sender<Delivery>, Arc<AtomicBool>)> {
        self.slots[category]
            .lock()
            .as_ref()
            .map(|slot| (slot.tx.clone(), slot.stalled.clone()))
    }
}

/// Delivery worker loop: runs handlers until the consumer is detached or replaced.
fn run_delivery_worker<F>(
    category: Category,
    rx: Receiver<Delivery>,
    mut handler: F,
    monitor: StallSink,
    stall_threshold: Duration,
) where
    F: FnMut(Delivery),
{
    for delivery in rx {
        let started = Instant::now();
        if panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
            warn!(%category, "consumer handler panicked; delivery discarded");
        }
        let took = started.elapsed();
        if took > stall_threshold {
            if let Some(monitor) = monitor.read().as_ref() {
                monitor.record_worker_stall(category, took);
            }
        }
    }
    debug!(%category, "delivery worker exiting");
}

/// What one dispatch tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub relayed: usize,
    pub batches: usize,
    pub batched_events: usize,
    /// Categories whose consumer's hand-off queue was full.
    pub stalled: Vec<Category>,
}

impl TickReport {
    pub fn delivered(&self) -> usize {
        self.relayed + self.batched_events
    }
}

/// Drains lanes in priority order and hands deliveries to consumers.
pub struct Dispatcher {
    lanes: Arc<LaneSet>,
    former: BatchFormer,
    registry: Arc<ConsumerRegistry>,
    monitor: Arc<PerformanceMonitor>,
}

impl Dispatcher {
    pub fn new(
        lanes: Arc<LaneSet>,
        former: BatchFormer,
        registry: Arc<ConsumerRegistry>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            lanes,
            former,
            registry,
            monitor,
        }
    }

    /// Run one tick over every category.
    pub fn tick(&self, now: Instant, draining: bool) -> TickReport {
        self.tick_categories(&Category::ALL, now, draining)
    }

    /// Run one tick over `categories`.
    ///
    /// Within a category, every resident Critical event is handed off before any High event,
    /// and High before Normal and Low batches. Deliveries carry `now` as their delivery time.
    pub fn tick_categories(
        &self,
        categories: &[Category],
        now: Instant,
        draining: bool,
    ) -> TickReport {
        let started = Instant::now();
        let mut report = TickReport::default();
        for category in categories {
            self.tick_category(*category, now, draining, &mut report);
        }
        self.monitor.record_tick(started.elapsed());
        report
    }

    fn tick_category(
        &self,
        category: Category,
        now: Instant,
        draining: bool,
        report: &mut TickReport,
    ) {
        // No consumer: events stay resident.
        let Some((tx, stalled)) = self.registry.handoff(category) else {
            return;
        };
        let capacity = tx.capacity().unwrap_or(usize::MAX);
        let mut budget = capacity.saturating_sub(tx.len());
        if budget == 0 {
            if !stalled.swap(true, Ordering::Relaxed) {
                warn!(%category, pending = tx.len(), "consumer hand-off queue full; skipping");
                self.monitor.record_handoff_stall(category, tx.len());
            }
            report.stalled.push(category);
            return;
        }
        stalled.store(false, Ordering::Relaxed);

        // ===== Relay Critical, then High =====
        for priority in Priority::RELAYED {
            if budget == 0 {
                return;
            }
            for event in self.lanes.drain_lane(category, priority, budget) {
                self.monitor.record_dispatch(&event, now);
                budget -= 1;
                report.relayed += 1;
                send(&tx, category, Delivery::Event(DeliveredEvent::new(event, now)));
            }
        }

        // ===== Batch Normal, then Low =====
        for priority in Priority::BATCHED {
            if budget == 0 {
                return;
            }
            for batch in self
                .former
                .form(&self.lanes, category, priority, now, draining, budget)
            {
                for event in &batch.events {
                    self.monitor.record_dispatch(event, now);
                }
                budget -= 1;
                report.batches += 1;
                report.batched_events += batch.len();
                send(&tx, category, Delivery::Batch(batch));
            }
        }
    }
}

/// Hand a delivery to the worker. Only the dispatcher sends, so free space seen at the start of
/// the tick cannot shrink underneath it.
fn send(tx: &Sender<Delivery>, category: Category, delivery: Delivery) {
    match tx.try_send(delivery) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
            warn!(%category, "delivery lost: consumer hand-off unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::batcher::BatchParams;
    use crossbeam_channel::unbounded;

    struct Fixture {
        lanes: Arc<LaneSet>,
        registry: Arc<ConsumerRegistry>,
        dispatcher: Dispatcher,
        monitor: Arc<PerformanceMonitor>,
    }

    fn fixture(config: &SchedulerConfig) -> Fixture {
        let (tx, _rx) = bounded(64);
        let monitor = Arc::new(PerformanceMonitor::new(config, tx));
        let lanes = Arc::new(LaneSet::new(
            config.lane_capacity.clone(),
            config.target_latency.clone(),
            monitor.clone(),
        ));
        lanes.open();
        let params = Arc::new(BatchParams::new(config));
        let former = BatchFormer::new(config, params, monitor.clone());
        let registry = Arc::new(ConsumerRegistry::new());
        registry.set_monitor(monitor.clone());
        let dispatcher = Dispatcher::new(lanes.clone(), former, registry.clone(), monitor.clone());
        Fixture {
            lanes,
            registry,
            dispatcher,
            monitor,
        }
    }

    fn settings(capacity: usize) -> ConsumerSettings {
        ConsumerSettings {
            handoff_capacity: capacity,
            stall_threshold: Duration::from_millis(5),
            strict: false,
        }
    }

    fn channel_consumer(
        registry: &ConsumerRegistry,
        category: Category,
        capacity: usize,
    ) -> Receiver<Delivery> {
        let (tx, rx) = unbounded();
        registry
            .register(category, settings(capacity), move |delivery| {
                let _ = tx.send(delivery);
            })
            .unwrap();
        rx
    }

    #[test]
    fn test_critical_is_delivered_before_other_priorities() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let rx = channel_consumer(&f.registry, Category::Audio, 64);
        let now = Instant::now();
        for priority in [Priority::Low, Priority::Normal, Priority::High, Priority::Critical] {
            for i in 0..3u8 {
                f.lanes.enqueue(Category::Audio, priority, &[i], None, now).unwrap();
            }
        }

        let report = f.dispatcher.tick(now, true);
        assert_eq!(report.relayed, 6);
        assert_eq!(report.batched_events, 6);

        let priorities: Vec<Priority> = (0..8)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap().priority())
            .collect();
        assert_eq!(
            priorities,
            vec![
                Priority::Critical,
                Priority::Critical,
                Priority::Critical,
                Priority::High,
                Priority::High,
                Priority::High,
                Priority::Normal,
                Priority::Low,
            ]
        );
    }

    #[test]
    fn test_categories_without_consumer_are_not_drained() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let now = Instant::now();
        f.lanes
            .enqueue(Category::Sync, Priority::Critical, &[1], None, now)
            .unwrap();
        let report = f.dispatcher.tick(now, true);
        assert_eq!(report.delivered(), 0);
        assert_eq!(f.lanes.depth(Category::Sync, Priority::Critical), 1);
    }

    #[test]
    fn test_late_relay_is_flagged() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let rx = channel_consumer(&f.registry, Category::Parameter, 8);
        let start = Instant::now();
        f.lanes
            .enqueue(Category::Parameter, Priority::High, &[1], Some(start), start)
            .unwrap();
        f.dispatcher.tick(start + Duration::from_millis(1), false);
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            Delivery::Event(delivered) => assert!(delivered.is_late()),
            Delivery::Batch(_) => panic!("relayed events are never batched"),
        }
        let snapshot = f.monitor.snapshot(&f.lanes.occupancy());
        assert_eq!(snapshot.priorities[Priority::High].late, 1);
    }

    #[test]
    fn test_blocked_consumer_does_not_stall_ticks() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let (release_tx, release_rx) = bounded::<()>(0);
        let (entered_tx, entered_rx) = unbounded();
        f.registry
            .register(Category::Visual, settings(2), move |_| {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();

        let now = Instant::now();
        f.lanes
            .enqueue(Category::Visual, Priority::Critical, &[0], None, now)
            .unwrap();
        f.dispatcher.tick(now, false);
        entered_rx.recv_timeout(Duration::from_secs(2)).unwrap();

        let mut worst = Duration::ZERO;
        for round in 1..=50u8 {
            let now = Instant::now();
            f.lanes
                .enqueue(Category::Visual, Priority::Critical, &[round], None, now)
                .unwrap();
            let started = Instant::now();
            f.dispatcher.tick(now, false);
            worst = worst.max(started.elapsed());
        }
        assert!(worst < Duration::from_millis(100), "worst tick {worst:?}");
        // One in the handler, two queued, the rest still resident.
        assert_eq!(f.lanes.depth(Category::Visual, Priority::Critical), 48);
        drop(release_tx);
    }

    #[test]
    fn test_strict_registration_refuses_second_consumer() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let strict = ConsumerSettings {
            strict: true,
            ..settings(4)
        };
        f.registry.register(Category::Audio, strict, |_| {}).unwrap();
        let err = f.registry.register(Category::Audio, strict, |_| {}).unwrap_err();
        assert!(matches!(err, SchedulerError::ConsumerConflict(Category::Audio)));

        assert!(f.registry.detach(Category::Audio));
        assert!(!f.registry.is_registered(Category::Audio));
        f.registry.register(Category::Audio, strict, |_| {}).unwrap();
    }

    #[test]
    fn test_last_registration_wins() {
        let config = SchedulerConfig::default();
        let f = fixture(&config);
        let first = channel_consumer(&f.registry, Category::UserInput, 8);
        let second = channel_consumer(&f.registry, Category::UserInput, 8);
        let now = Instant::now();
        f.lanes
            .enqueue(Category::UserInput, Priority::Critical, &[7], None, now)
            .unwrap();
        f.dispatcher.tick(now, false);
        assert!(second.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(first.try_recv().is_err());
    }
}
