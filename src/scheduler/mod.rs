//! Scheduling stages: intake lanes, adaptive batching and deadline dispatch.

pub mod batcher;
pub mod dispatcher;
pub mod lanes;

pub use batcher::{Adjustment, BatchController, BatchFormer, BatchParams, ControlSample, TuningState};
pub use dispatcher::{ConsumerRegistry, ConsumerSettings, Dispatcher, TickReport};
pub use lanes::LaneSet;
