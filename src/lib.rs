//! Real-time event scheduling and adaptive batching for frame- and device-timed consumers.
//!
//! Producers submit prioritized, time-stamped events with [`Scheduler::enqueue`]. Critical and
//! High events are relayed individually on every dispatch tick; Normal and Low events are grouped
//! into per-category batches whose size and flush interval are retuned from observed latency.

pub mod buffer_pool;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod metrics;
pub mod priority;
pub mod scheduler;
pub mod threading;

pub use config::SchedulerConfig;
pub use engine::{Scheduler, SchedulerState, ShutdownReport};
pub use error::{ConfigError, RejectReason, SchedulerError};
pub use event::{Batch, DeliveredEvent, Delivery, DeliveryOutcome, DropReason, Event, EventId};
pub use metrics::{Advisory, AdvisoryKind, MetricsSnapshot};
pub use priority::{Category, CategoryTable, Priority, PriorityTable};
