//! Event representation shared by the lanes, batcher, dispatcher and consumers.

use crate::buffer_pool::{self, BufferHandle};
use crate::priority::{Category, Priority};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

/// Identifier assigned at admission. Strictly increasing per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evt-{}", self.0)
    }
}

/// Latest acceptable delivery time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Critical/High: delivery after this instant is flagged late.
    Hard(Instant),
    /// Normal/Low: a latency target, used for tail statistics only.
    Soft(Instant),
}

impl Deadline {
    pub fn at(self) -> Instant {
        match self {
            Deadline::Hard(at) | Deadline::Soft(at) => at,
        }
    }
}

/// Immutable payload bytes backed by a pooled buffer. Clones share the allocation.
#[derive(Debug, Clone)]
pub struct Payload {
    buffer: BufferHandle,
}

impl Payload {
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self {
            buffer: buffer_pool::copy_from(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Unit of work travelling through the scheduler.
///
/// An event is never mutated once admitted: fields are private and only readable. It leaves the
/// scheduler either delivered, dropped with a [`DropReason`], or expired.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    category: Category,
    priority: Priority,
    deadline: Deadline,
    payload: Payload,
    enqueued_at: Instant,
}

impl Event {
    /// Build an event at admission time.
    ///
    /// Critical/High events without an explicit deadline get `enqueued_at + target`; Normal/Low
    /// events always get a soft target of `enqueued_at + target` and ignore `deadline`.
    pub(crate) fn new(
        id: EventId,
        category: Category,
        priority: Priority,
        payload: Payload,
        deadline: Option<Instant>,
        enqueued_at: Instant,
        target: Duration,
    ) -> Self {
        let deadline = if priority.has_hard_deadline() {
            Deadline::Hard(deadline.unwrap_or(enqueued_at + target))
        } else {
            Deadline::Soft(enqueued_at + target)
        };
        Self {
            id,
            category,
            priority,
            deadline,
            payload,
            enqueued_at,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Time spent in the scheduler if delivered at `now`.
    pub fn latency_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }

    /// Whether delivery at `now` misses the deadline (hard or soft).
    pub fn is_late_at(&self, now: Instant) -> bool {
        now > self.deadline.at()
    }
}

/// How a delivery relates to the event's deadline. Informational, never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    OnTime,
    Late,
}

/// Delivery record of a Critical/High event relayed on its own.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub event: Event,
    pub delivered_at: Instant,
    pub outcome: DeliveryOutcome,
}

impl DeliveredEvent {
    pub(crate) fn new(event: Event, delivered_at: Instant) -> Self {
        let outcome = if event.is_late_at(delivered_at) {
            DeliveryOutcome::Late
        } else {
            DeliveryOutcome::OnTime
        };
        Self {
            event,
            delivered_at,
            outcome,
        }
    }

    pub fn is_late(&self) -> bool {
        self.outcome == DeliveryOutcome::Late
    }
}

/// Same-category, same-priority group of Normal/Low events delivered in one call.
///
/// Events are kept in lane order; consumers see all of them or none.
#[derive(Debug, Clone)]
pub struct Batch {
    pub category: Category,
    pub priority: Priority,
    pub formed_at: Instant,
    pub events: Vec<Event>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// What a consumer handler receives.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(DeliveredEvent),
    Batch(Batch),
}

impl Delivery {
    pub fn category(&self) -> Category {
        match self {
            Delivery::Event(delivered) => delivered.event.category(),
            Delivery::Batch(batch) => batch.category,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Delivery::Event(delivered) => delivered.event.priority(),
            Delivery::Batch(batch) => batch.priority,
        }
    }

    /// Events carried by this delivery, in delivery order.
    pub fn events(&self) -> Vec<&Event> {
        match self {
            Delivery::Event(delivered) => vec![&delivered.event],
            Delivery::Batch(batch) => batch.events.iter().collect(),
        }
    }
}

/// Why an admitted event left the scheduler without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// Made room for a newer or more urgent event (overflow policy).
    Evicted,
    /// Outlived the configured maximum age before it could be batched.
    Expired,
    /// Still resident when a drain timed out.
    ShutdownDrop,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(priority: Priority, deadline: Option<Instant>, at: Instant) -> Event {
        Event::new(
            EventId(1),
            Category::Parameter,
            priority,
            Payload::copy_from(&[1, 2, 3]),
            deadline,
            at,
            Duration::from_millis(10),
        )
    }

    #[test]
    fn hard_deadline_defaults_to_target_latency() {
        let now = Instant::now();
        let e = event(Priority::Critical, None, now);
        assert_eq!(e.deadline(), Deadline::Hard(now + Duration::from_millis(10)));
        assert_eq!(e.payload().as_bytes(), &[1, 2, 3]);
    }

    #[test]
    fn explicit_deadline_is_kept_for_hard_priorities_only() {
        let now = Instant::now();
        let explicit = now + Duration::from_millis(2);
        assert_eq!(
            event(Priority::High, Some(explicit), now).deadline(),
            Deadline::Hard(explicit)
        );
        assert_eq!(
            event(Priority::Low, Some(explicit), now).deadline(),
            Deadline::Soft(now + Duration::from_millis(10))
        );
    }

    #[test]
    fn late_delivery_is_flagged_not_dropped() {
        let now = Instant::now();
        let e = event(Priority::Critical, Some(now), now);
        let delivered = DeliveredEvent::new(e, now + Duration::from_millis(1));
        assert!(delivered.is_late());
        assert_eq!(delivered.event.latency_at(now + Duration::from_millis(1)), Duration::from_millis(1));
    }
}
