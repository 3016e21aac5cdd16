//! TaskPipe - In-Process Orchestration Engine
//!
//! A generic scheduler library for composing independent units of work into
//! sequences, parallel stages, and bounded-concurrency queues, with
//! cooperative cancellation, structured result aggregation, and lifecycle
//! notifications. Callers supply the actual work as pluggable condition/work
//! functions; the engine supplies execution ordering, concurrency admission,
//! stop propagation, and failure aggregation.
//!
//! # Architecture
//!
//! The library is organized into three main modules:
//!
//! - [`node`]: The shared contract: the [`Node`] trait, run states,
//!   results, payloads, and lifecycle hooks
//! - [`runner`]: The concrete node kinds: [`Unit`], [`Pipeline`], and
//!   [`WorkQueue`]
//! - [`error`]: The engine's error taxonomy
//!
//! # Example
//!
//! ```rust
//! use taskpipe::{new_payload, Node, Pipeline, RunResult, Unit};
//!
//! let fetch = Unit::builder("fetch")
//!     .work(|_, payload| {
//!         payload.write().insert("rows".to_string(), serde_json::json!(3));
//!         RunResult::ok_with("fetched")
//!     })
//!     .build();
//!
//! let report = Unit::builder("report")
//!     .work(|_, payload| match payload.read().get("rows") {
//!         Some(rows) => RunResult::ok_with(format!("reported {} rows", rows)),
//!         None => RunResult::fail("nothing fetched"),
//!     })
//!     .build();
//!
//! let pipeline = Pipeline::new("nightly");
//! pipeline.push(fetch);
//! pipeline.push(report);
//!
//! let result = pipeline.start(new_payload());
//! assert!(result.success);
//! assert_eq!(result.messages, vec!["fetched", "reported 3 rows"]);
//! ```

pub mod error;
pub mod node;
pub mod runner;

// Re-export commonly used types
pub use error::NodeError;
pub use node::{
    new_payload, payload_from, AsyncArgs, ErrorArgs, HookId, Hooks, Node, NodeFn, NodeId, Payload,
    PayloadMap, ProcArgs, RunResult, RunState, SharedNodeFn,
};
pub use runner::{Pipeline, PipelineBuilder, Unit, UnitBuilder, WorkQueue, WorkQueueBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_composite_pipeline_with_queue() {
        init_logging();

        // A queue of three workers spliced between two serial units.
        let queue = WorkQueue::new("inner-pool", 2);
        for index in 0..3 {
            queue.enqueue(Unit::new(format!("job-{}", index), move |_, _| {
                RunResult::ok_with(format!("job-{}", index))
            }));
        }

        let pipeline = Pipeline::new("outer");
        pipeline.push(Unit::new("prelude", |_, _| RunResult::ok_with("prelude")));
        pipeline.push(queue);
        pipeline.push(Unit::new("coda", |_, _| RunResult::ok_with("coda")));

        let result = pipeline.start(new_payload());

        assert!(result.success, "messages: {:?}", result.messages);
        assert_eq!(result.messages.first().map(String::as_str), Some("prelude"));
        assert_eq!(result.messages.last().map(String::as_str), Some("coda"));
        assert_eq!(pipeline.state(), RunState::Done);
    }

    #[test]
    fn test_payload_flows_through_composite_run() {
        init_logging();

        let writer = Unit::new("writer", |_, payload| {
            payload
                .write()
                .insert("token".to_string(), serde_json::json!("issued"));
            RunResult::ok()
        });
        let reader = Unit::new("reader", |_, payload| match payload.read().get("token") {
            Some(value) if value == "issued" => RunResult::ok(),
            _ => RunResult::fail("token missing"),
        });

        let pipeline = Pipeline::new("session");
        pipeline.push_serial([writer as Arc<dyn Node>, reader as Arc<dyn Node>]);

        assert!(pipeline.start(new_payload()).success);
    }
}
