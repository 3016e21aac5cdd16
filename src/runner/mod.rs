//! Runners
//!
//! The three concrete node kinds plus the gate primitive they share:
//!
//! - [`Unit`]: a leaf running one start-condition -> work -> finish-condition
//!   chain
//! - [`Pipeline`]: an ordered sequence of concurrently-run stages with
//!   deferred joins
//! - [`WorkQueue`]: a FIFO drained under a concurrency cap with the
//!   hold/continue admission protocol

mod gate;

pub mod pipeline;
pub mod queue;
pub mod unit;

pub use self::pipeline::{Pipeline, PipelineBuilder};
pub use self::queue::{WorkQueue, WorkQueueBuilder};
pub use self::unit::{Unit, UnitBuilder};
