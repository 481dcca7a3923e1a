//! Priority Lane Set: concurrent intake for every (category, priority) pair.
//!
//! Each lane is a short-held `parking_lot::Mutex<VecDeque<Event>>` with an atomic length mirror,
//! so producers for different lanes never touch the same lock and depth queries are lock-free.
//! Cross-lane coordination only happens on the overflow path, when an urgent event has to borrow
//! a slot from a lower-priority lane; that path is serialized by its own narrow mutex so it never
//! blocks ordinary admissions.
//!
//! Every admission also reserves a slot in a shared residency counter capped at the sum of all
//! lane capacities. A borrowed slot is handed from the evicted event to the urgent one without
//! ever being released, so a concurrent producer cannot take it in between.

use crate::error::RejectReason;
use crate::event::{DropReason, Event, EventId, Payload};
use crate::metrics::{LaneOccupancy, PerformanceMonitor};
use crate::priority::{Category, CategoryTable, Priority, PriorityTable};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One FIFO of pending events.
struct Lane {
    queue: Mutex<VecDeque<Event>>,
    /// Mirror of `queue.len()`, updated while the lock is held.
    len: AtomicUsize,
}

impl Lane {
    fn new(capacity: usize) -> Self {
        Self {
            // Pre-size small lanes fully; large ones grow on demand.
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            len: AtomicUsize::new(0),
        }
    }
}

/// The set of all lanes plus admission bookkeeping.
///
/// Normal and Low lanes never hold more than their configured capacity. Critical and High lanes
/// may exceed theirs by the slots they borrowed from Normal/Low events; total residency across
/// all lanes never exceeds the sum of the configured capacities.
pub struct LaneSet {
    lanes: CategoryTable<PriorityTable<Lane>>,
    capacity: PriorityTable<usize>,
    total_capacity: usize,
    /// Slots held by resident events (plus admissions in flight). Never above `total_capacity`.
    reserved: AtomicUsize,
    target_latency: PriorityTable<Duration>,
    open: AtomicBool,
    next_id: AtomicU64,
    /// Serializes cross-lane evictions triggered by Critical/High overflow.
    borrow: Mutex<()>,
    monitor: Arc<PerformanceMonitor>,
}

impl LaneSet {
    /// Create closed lanes sized by `capacity` (per priority, for every category).
    pub fn new(
        capacity: PriorityTable<usize>,
        target_latency: PriorityTable<Duration>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        let total_capacity =
            capacity.iter().map(|(_, c)| *c).sum::<usize>() * Category::ALL.len();
        Self {
            lanes: CategoryTable::from_fn(|_| PriorityTable::from_fn(|p| Lane::new(capacity[p]))),
            capacity,
            total_capacity,
            reserved: AtomicUsize::new(0),
            target_latency,
            open: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            borrow: Mutex::new(()),
            monitor,
        }
    }

    fn lane(&self, category: Category, priority: Priority) -> &Lane {
        &self.lanes[category][priority]
    }

    /// Lock a lane, recording whether the acquisition had to wait.
    fn lock<'a>(&self, lane: &'a Lane) -> MutexGuard<'a, VecDeque<Event>> {
        match lane.queue.try_lock() {
            Some(guard) => {
                self.monitor.record_lock(false);
                guard
            }
            None => {
                self.monitor.record_lock(true);
                lane.queue.lock()
            }
        }
    }

    /// Admit an event, applying the overflow policy when its lane is full.
    ///
    /// Never blocks beyond the short lane critical sections. Returns the assigned id, or the
    /// reason the event was refused.
    pub fn enqueue(
        &self,
        category: Category,
        priority: Priority,
        payload: &[u8],
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<EventId, RejectReason> {
        let result = self.admit(category, priority, payload, deadline, now);
        if let Err(reason) = result {
            self.monitor.record_reject(priority, reason);
        }
        result
    }

    fn admit(
        &self,
        category: Category,
        priority: Priority,
        payload: &[u8],
        deadline: Option<Instant>,
        now: Instant,
    ) -> Result<EventId, RejectReason> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RejectReason::Closed);
        }
        let max = category.max_payload();
        if payload.len() > max {
            return Err(RejectReason::PayloadTooLarge {
                len: payload.len(),
                max,
            });
        }
        // Copy outside the lane lock.
        let payload = Payload::copy_from(payload);
        let lane = self.lane(category, priority);
        let capacity = self.capacity[priority];

        {
            let mut queue = self.lock(lane);
            // Checked under the lock so `close()` is a barrier for admissions.
            if !self.open.load(Ordering::Acquire) {
                return Err(RejectReason::Closed);
            }
            if queue.len() < capacity && self.try_reserve() {
                return Ok(self.push(lane, &mut queue, category, priority, payload, deadline, now));
            }
            if priority.is_batched() {
                // Full Normal/Low lane, or every slot taken: the oldest resident of this lane
                // makes room and hands its slot over.
                if queue.pop_front().is_none() {
                    return Err(RejectReason::Full);
                }
                self.monitor.record_drop(priority, DropReason::Evicted, 1);
                return Ok(self.push(lane, &mut queue, category, priority, payload, deadline, now));
            }
        }

        // Critical/High without a free slot: take over the slot of the lowest-priority resident.
        if !self.evict_lowest() {
            return Err(RejectReason::Full);
        }
        let mut queue = self.lock(lane);
        if !self.open.load(Ordering::Acquire) {
            self.release(1);
            return Err(RejectReason::Closed);
        }
        Ok(self.push(lane, &mut queue, category, priority, payload, deadline, now))
    }

    /// Claim one slot of the total capacity.
    fn try_reserve(&self) -> bool {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held < self.total_capacity).then_some(held + 1)
            })
            .is_ok()
    }

    fn release(&self, slots: usize) {
        if slots > 0 {
            self.reserved.fetch_sub(slots, Ordering::AcqRel);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &self,
        lane: &Lane,
        queue: &mut VecDeque<Event>,
        category: Category,
        priority: Priority,
        payload: Payload,
        deadline: Option<Instant>,
        now: Instant,
    ) -> EventId {
        // Assigned under the lane lock so ids increase in lane order.
        let id = EventId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let event = Event::new(
            id,
            category,
            priority,
            payload,
            deadline,
            now,
            self.target_latency[priority],
        );
        self.monitor.record_enqueue(&event);
        queue.push_back(event);
        lane.len.store(queue.len(), Ordering::Release);
        id
    }

    /// Evict the oldest Low event system-wide, else the oldest Normal one.
    ///
    /// The victim's slot stays reserved; the caller either fills it or releases it.
    fn evict_lowest(&self) -> bool {
        let _borrow = self.borrow.lock();
        for priority in [Priority::Low, Priority::Normal] {
            loop {
                let oldest = Category::ALL
                    .iter()
                    .filter(|category| self.depth(**category, priority) > 0)
                    .filter_map(|category| {
                        self.oldest_enqueued_at(*category, priority)
                            .map(|at| (at, *category))
                    })
                    .min_by_key(|(at, _)| *at);
                let Some((_, category)) = oldest else {
                    break;
                };
                let lane = self.lane(category, priority);
                let mut queue = self.lock(lane);
                // The lane may have been drained since it was inspected; look again.
                if queue.pop_front().is_some() {
                    lane.len.store(queue.len(), Ordering::Release);
                    self.monitor.record_drop(priority, DropReason::Evicted, 1);
                    return true;
                }
            }
        }
        false
    }

    /// Remove up to `max` of the oldest events from one lane, in lane order.
    pub fn drain_lane(&self, category: Category, priority: Priority, max: usize) -> Vec<Event> {
        let lane = self.lane(category, priority);
        if max == 0 || lane.len.load(Ordering::Acquire) == 0 {
            return Vec::new();
        }
        let mut queue = self.lock(lane);
        let take = max.min(queue.len());
        let drained: Vec<Event> = queue.drain(..take).collect();
        lane.len.store(queue.len(), Ordering::Release);
        drop(queue);
        self.release(drained.len());
        drained
    }

    /// Drop leading events that have waited at least `max_age`. Returns how many were removed.
    pub fn expire(
        &self,
        category: Category,
        priority: Priority,
        max_age: Duration,
        now: Instant,
    ) -> usize {
        let lane = self.lane(category, priority);
        if lane.len.load(Ordering::Acquire) == 0 {
            return 0;
        }
        let mut queue = self.lock(lane);
        let mut expired = 0;
        while queue
            .front()
            .is_some_and(|event| event.latency_at(now) >= max_age)
        {
            queue.pop_front();
            expired += 1;
        }
        lane.len.store(queue.len(), Ordering::Release);
        drop(queue);
        self.release(expired);
        if expired > 0 {
            self.monitor
                .record_drop(priority, DropReason::Expired, expired as u64);
        }
        expired
    }

    /// Admission time of the oldest resident event of one lane.
    pub fn oldest_enqueued_at(&self, category: Category, priority: Priority) -> Option<Instant> {
        let lane = self.lane(category, priority);
        if lane.len.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.lock(lane).front().map(Event::enqueued_at)
    }

    #[inline]
    pub fn depth(&self, category: Category, priority: Priority) -> usize {
        self.lane(category, priority).len.load(Ordering::Acquire)
    }

    pub fn capacity(&self, priority: Priority) -> usize {
        self.capacity[priority]
    }

    /// Sum of every lane's configured capacity.
    pub fn total_capacity(&self) -> usize {
        self.total_capacity
    }

    /// Resident events across all lanes.
    pub fn resident(&self) -> usize {
        self.lanes
            .iter()
            .flat_map(|(_, table)| table.iter().map(|(_, lane)| lane.len.load(Ordering::Acquire)))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.resident() == 0
    }

    pub fn occupancy(&self) -> LaneOccupancy {
        LaneOccupancy {
            depth: CategoryTable::from_fn(|category| {
                PriorityTable::from_fn(|priority| self.depth(category, priority))
            }),
            capacity: self.capacity.clone(),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Stop admitting events. Once this returns no further event can land in any lane.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        for (_, table) in self.lanes.iter() {
            for (_, lane) in table.iter() {
                drop(lane.queue.lock());
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Discard every resident event as a shutdown drop. Returns the count per priority.
    pub fn clear(&self) -> PriorityTable<u64> {
        let mut dropped = PriorityTable::from_fn(|_| 0u64);
        for (_, table) in self.lanes.iter() {
            for (priority, lane) in table.iter() {
                let mut queue = lane.queue.lock();
                let cleared = queue.len();
                dropped[priority] += cleared as u64;
                queue.clear();
                lane.len.store(0, Ordering::Release);
                drop(queue);
                self.release(cleared);
            }
        }
        for (priority, count) in dropped.iter() {
            if *count > 0 {
                self.monitor
                    .record_drop(priority, DropReason::ShutdownDrop, *count);
            }
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use proptest::prelude::*;

    fn lanes_with(capacity: PriorityTable<usize>) -> LaneSet {
        let (tx, _rx) = crossbeam_channel::bounded(16);
        let config = SchedulerConfig::default();
        let monitor = Arc::new(PerformanceMonitor::new(&config, tx));
        let lanes = LaneSet::new(capacity, config.target_latency.clone(), monitor);
        lanes.open();
        lanes
    }

    fn small(capacity: usize) -> LaneSet {
        lanes_with(PriorityTable::from_fn(|_| capacity))
    }

    #[test]
    fn test_closed_lanes_reject() {
        let lanes = small(4);
        lanes.close();
        let now = Instant::now();
        assert_eq!(
            lanes.enqueue(Category::Audio, Priority::Critical, &[1], None, now),
            Err(RejectReason::Closed)
        );
        assert!(lanes.is_empty());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let lanes = small(4);
        let err = lanes
            .enqueue(Category::Sync, Priority::High, &[0; 17], None, Instant::now())
            .unwrap_err();
        assert_eq!(err, RejectReason::PayloadTooLarge { len: 17, max: 16 });
    }

    #[test]
    fn test_capacity_plus_one_evicts_exactly_one_low_event() {
        let lanes = small(8);
        let now = Instant::now();
        let ids: Vec<EventId> = (0..9u8)
            .map(|i| {
                lanes
                    .enqueue(Category::Visual, Priority::Low, &[i], None, now)
                    .unwrap()
            })
            .collect();

        assert_eq!(lanes.depth(Category::Visual, Priority::Low), 8);
        let remaining = lanes.drain_lane(Category::Visual, Priority::Low, 100);
        assert_eq!(remaining.len(), 8);
        assert_eq!(remaining[0].id(), ids[1]);
        assert_eq!(remaining[7].id(), ids[8]);

        let snapshot = lanes.monitor.snapshot(&lanes.occupancy());
        assert_eq!(snapshot.priorities[Priority::Low].evicted, 1);
    }

    #[test]
    fn test_critical_borrows_from_oldest_low_system_wide() {
        let lanes = small(2);
        let start = Instant::now();
        lanes
            .enqueue(Category::Audio, Priority::Low, &[1], None, start)
            .unwrap();
        lanes
            .enqueue(Category::Visual, Priority::Low, &[2], None, start + Duration::from_millis(1))
            .unwrap();
        lanes
            .enqueue(Category::Visual, Priority::Normal, &[3], None, start)
            .unwrap();
        for i in 0..2u8 {
            lanes
                .enqueue(Category::Sync, Priority::Critical, &[i], None, start)
                .unwrap();
        }

        lanes
            .enqueue(Category::Sync, Priority::Critical, &[9], None, start)
            .unwrap();
        assert_eq!(lanes.depth(Category::Sync, Priority::Critical), 3);
        assert_eq!(lanes.depth(Category::Audio, Priority::Low), 0);
        assert_eq!(lanes.depth(Category::Visual, Priority::Low), 1);

        lanes
            .enqueue(Category::Sync, Priority::Critical, &[10], None, start)
            .unwrap();
        lanes
            .enqueue(Category::Sync, Priority::Critical, &[11], None, start)
            .unwrap();
        assert_eq!(lanes.depth(Category::Visual, Priority::Normal), 0);

        // Only Critical events left: nothing may be evicted.
        assert_eq!(
            lanes.enqueue(Category::Sync, Priority::Critical, &[12], None, start),
            Err(RejectReason::Full)
        );
        assert_eq!(lanes.resident(), 5);
    }

    #[test]
    fn test_expire_removes_only_old_events() {
        let lanes = small(16);
        let start = Instant::now();
        lanes
            .enqueue(Category::Parameter, Priority::Normal, &[1], None, start)
            .unwrap();
        lanes
            .enqueue(
                Category::Parameter,
                Priority::Normal,
                &[2],
                None,
                start + Duration::from_millis(50),
            )
            .unwrap();
        let expired = lanes.expire(
            Category::Parameter,
            Priority::Normal,
            Duration::from_millis(40),
            start + Duration::from_millis(60),
        );
        assert_eq!(expired, 1);
        assert_eq!(lanes.depth(Category::Parameter, Priority::Normal), 1);
    }

    #[test]
    fn test_clear_counts_shutdown_drops() {
        let lanes = small(1024);
        let now = Instant::now();
        for _ in 0..500 {
            lanes
                .enqueue(Category::UserInput, Priority::Low, &[0], None, now)
                .unwrap();
        }
        let dropped = lanes.clear();
        assert_eq!(dropped[Priority::Low], 500);
        assert!(lanes.is_empty());
    }

    #[test]
    fn test_concurrent_producers_respect_lane_capacity() {
        let lanes = Arc::new(small(64));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lanes = lanes.clone();
                std::thread::spawn(move || {
                    for i in 0..1000u32 {
                        let _ = lanes.enqueue(
                            Category::Visual,
                            Priority::Normal,
                            &i.to_le_bytes(),
                            None,
                            Instant::now(),
                        );
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(lanes.depth(Category::Visual, Priority::Normal), 64);
        let snapshot = lanes.monitor.snapshot(&lanes.occupancy());
        assert_eq!(snapshot.priorities[Priority::Normal].evicted, 4000 - 64);
    }

    #[test]
    fn test_borrowed_slots_cannot_be_refilled_concurrently() {
        let lanes = Arc::new(small(4));
        let now = Instant::now();
        for category in Category::ALL {
            for priority in Priority::ALL {
                for i in 0..4u8 {
                    lanes.enqueue(category, priority, &[i], None, now).unwrap();
                }
            }
        }
        assert_eq!(lanes.resident(), lanes.total_capacity());

        let urgent = {
            let lanes = lanes.clone();
            std::thread::spawn(move || {
                (0..200u32)
                    .filter(|i| {
                        lanes
                            .enqueue(Category::Sync, Priority::Critical, &[*i as u8], None, Instant::now())
                            .is_ok()
                    })
                    .count()
            })
        };
        let background = {
            let lanes = lanes.clone();
            std::thread::spawn(move || {
                for i in 0..20_000u32 {
                    let _ = lanes.enqueue(
                        Category::Audio,
                        Priority::Low,
                        &i.to_le_bytes(),
                        None,
                        Instant::now(),
                    );
                }
            })
        };
        let admitted = urgent.join().unwrap();
        background.join().unwrap();

        assert!(lanes.resident() <= lanes.total_capacity());
        assert!(lanes.depth(Category::Audio, Priority::Low) <= 4);
        assert_eq!(admitted, 40);
        assert_eq!(lanes.depth(Category::Sync, Priority::Critical), 4 + admitted);
        // Every borrowed slot came from a Normal/Low event somewhere.
        let batched: usize = Category::ALL
            .iter()
            .flat_map(|c| Priority::BATCHED.map(|p| lanes.depth(*c, p)))
            .sum();
        assert_eq!(batched, 0);
        assert_eq!(lanes.resident(), lanes.total_capacity());
    }

    proptest! {
        #[test]
        fn prop_drain_order_equals_enqueue_order(
            payloads in proptest::collection::vec(any::<u8>(), 1..200),
            chunk in 1usize..32,
        ) {
            let lanes = small(256);
            let now = Instant::now();
            let ids: Vec<EventId> = payloads
                .iter()
                .map(|b| lanes.enqueue(Category::Audio, Priority::Normal, &[*b], None, now).unwrap())
                .collect();

            let mut drained = Vec::new();
            loop {
                let batch = lanes.drain_lane(Category::Audio, Priority::Normal, chunk);
                if batch.is_empty() {
                    break;
                }
                drained.extend(batch);
            }
            let drained_ids: Vec<EventId> = drained.iter().map(Event::id).collect();
            let drained_payloads: Vec<u8> = drained.iter().map(|e| e.payload().as_bytes()[0]).collect();
            prop_assert_eq!(drained_ids, ids);
            prop_assert_eq!(drained_payloads, payloads);
        }
    }
}
