//! Leaf Unit Runner
//!
//! A [`Unit`] is the smallest runnable node: one start-condition -> work ->
//! finish-condition chain. Composite runners are built out of units, but a
//! unit alone is a complete node: it can be started synchronously or
//! asynchronously, stopped cooperatively, and observed through the full set
//! of lifecycle hooks.
//!
//! # Example
//!
//! ```rust
//! use taskpipe::{new_payload, Node, RunState, RunResult, Unit};
//!
//! let unit = Unit::builder("greet")
//!     .work(|_, _| RunResult::ok_with("hello"))
//!     .build();
//!
//! let result = unit.start(new_payload());
//! assert!(result.success);
//! assert_eq!(unit.state(), RunState::Done);
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::node::core::{always_pass, next_node_id, run_guarded, Node, NodeId, SharedNodeFn};
use crate::node::hooks::Hooks;
use crate::node::payload::{new_payload, Payload, PayloadMap};
use crate::node::result::RunResult;
use crate::node::state::{RunState, StateCell};

/// Fields mutated by both the start body and externally invoked stop calls,
/// guarded by the fine-grained process lock.
struct UnitProc {
    stop_result: Option<RunResult>,
    payload: Option<Payload>,
}

/// A leaf node running exactly one work-process.
pub struct Unit {
    name: String,
    id: NodeId,
    weak_self: Weak<Unit>,
    state: StateCell,
    stop_flag: AtomicBool,
    run_lock: Arc<Mutex<()>>,
    proc: Mutex<UnitProc>,
    hooks: Hooks,
    start_condition: SharedNodeFn,
    finish_condition: SharedNodeFn,
    work: SharedNodeFn,
    stop_process: Option<SharedNodeFn>,
}

impl Unit {
    /// Starts building a unit with the given name.
    pub fn builder(name: impl Into<String>) -> UnitBuilder {
        UnitBuilder::new(name)
    }

    /// Shorthand for a unit with only a work-process.
    pub fn new(
        name: impl Into<String>,
        work: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Arc<Unit> {
        UnitBuilder::new(name).work(work).build()
    }

    /// Merges the given entries into the stored payload, creating it first
    /// if this unit has never been handed one, and returns the payload.
    pub fn update_payload(&self, additional: PayloadMap) -> Payload {
        let mut proc = self.proc.lock();
        let payload = proc.payload.get_or_insert_with(new_payload);
        {
            let mut map = payload.write();
            for (key, value) in additional {
                map.insert(key, value);
            }
        }
        Arc::clone(payload)
    }

    fn origin(&self) -> Weak<dyn Node> {
        let weak: Weak<dyn Node> = self.weak_self.clone();
        weak
    }

    /// Stamps this unit's identity onto a callback result.
    fn tag(&self, mut result: RunResult) -> RunResult {
        result.name = self.name.clone();
        result.origin = Some(self.origin());
        result
    }

    fn emit_stopped_and_finished(&self, result: RunResult) -> RunResult {
        self.hooks.emit_stopped(&self.name, Some(result.clone()));
        self.hooks.emit_finished(&self.name, Some(result.clone()));
        result
    }

    fn run_body(&self, payload: Payload) -> RunResult {
        {
            let mut proc = self.proc.lock();
            proc.payload = Some(Arc::clone(&payload));

            if self.state.load() != RunState::Ready {
                self.state.store(RunState::Stopped);
                drop(proc);
                let result = self.tag(RunResult::fail(NodeError::NotReady.to_string()));
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }

            proc.stop_result = None;
        }

        let mut result = self.tag((self.start_condition)(self, &payload));
        {
            let mut proc = self.proc.lock();
            if self.stop_flag.load(Ordering::Relaxed) {
                self.state.store(RunState::Stopped);
                result.absorb(proc.stop_result.as_ref());
                drop(proc);
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }
            if !result.success {
                self.state.store(RunState::Stopped);
                drop(proc);
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }
            self.state.store(RunState::Running);
        }

        debug!("unit `{}` running", self.name);
        self.hooks
            .emit_started(&self.name, Some(self.tag(RunResult::ok())));

        let mut result = self.tag((self.work)(self, &payload));
        {
            let mut proc = self.proc.lock();
            if self.stop_flag.load(Ordering::Relaxed) {
                self.state.store(RunState::Stopped);
                result.absorb(proc.stop_result.as_ref());
                drop(proc);
                return self.emit_stopped_and_finished(result);
            }
            if !result.success {
                self.state.store(RunState::Stopped);
                drop(proc);
                return self.emit_stopped_and_finished(result);
            }
        }

        // The finish-condition gates completion; on success the work result
        // (and its messages) is what the caller receives.
        let verdict = self.tag((self.finish_condition)(self, &payload));
        if !verdict.success {
            self.state.store(RunState::Stopped);
            return self.emit_stopped_and_finished(verdict);
        }

        self.state.store(RunState::Done);
        debug!("unit `{}` done", self.name);
        self.hooks.emit_finished(&self.name, Some(result.clone()));
        result
    }
}

impl Node for Unit {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> NodeId {
        self.id
    }

    fn state(&self) -> RunState {
        self.state.load()
    }

    fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed)
    }

    fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    fn start(&self, payload: Payload) -> RunResult {
        let _run = self.run_lock.lock();
        run_guarded(&self.name, Some(self.origin()), &self.hooks, || {
            self.run_body(payload)
        })
    }

    fn stop(&self) {
        let mut proc = self.proc.lock();
        if self.state.load() != RunState::Running {
            self.state.store(RunState::Stopped);
            self.stop_flag.store(true, Ordering::Relaxed);
            proc.stop_result = None;
        } else {
            self.stop_flag.store(true, Ordering::Relaxed);
            self.state.store(RunState::Stopping);
            self.hooks.emit_stopping(&self.name);
            let payload = proc.payload.clone().unwrap_or_else(new_payload);
            proc.stop_result = self.stop_process.as_ref().map(|f| f(self, &payload));
        }
    }
}

impl std::fmt::Debug for Unit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.name)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Unit`].
///
/// Everything except the name is optional: conditions default to
/// always-succeed, the work-process to a no-op success, and the stop-process
/// to absent (a stop merged without one fails the result). A caller-supplied
/// execution lock lets several units serialize their start calls.
pub struct UnitBuilder {
    name: String,
    start_condition: Option<SharedNodeFn>,
    finish_condition: Option<SharedNodeFn>,
    work: Option<SharedNodeFn>,
    stop_process: Option<SharedNodeFn>,
    run_lock: Option<Arc<Mutex<()>>>,
}

impl UnitBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_condition: None,
            finish_condition: None,
            work: None,
            stop_process: None,
            run_lock: None,
        }
    }

    /// Condition evaluated before the unit transitions to running.
    pub fn start_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.start_condition = Some(Arc::new(f));
        self
    }

    /// Condition evaluated after the work-process succeeds.
    pub fn finish_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.finish_condition = Some(Arc::new(f));
        self
    }

    /// The unit's work-process.
    pub fn work(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.work = Some(Arc::new(f));
        self
    }

    /// Compensating hook run synchronously by a stop call while the unit is
    /// running; its result becomes authoritative for the merged stop result.
    pub fn stop_process(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.stop_process = Some(Arc::new(f));
        self
    }

    /// Execution lock serializing this unit's start call; share one handle
    /// across several units to serialize them against each other.
    pub fn run_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = Some(lock);
        self
    }

    /// Finishes the build.
    pub fn build(self) -> Arc<Unit> {
        Arc::new_cyclic(|weak| Unit {
            name: self.name,
            id: next_node_id(),
            weak_self: weak.clone(),
            state: StateCell::new(RunState::Ready),
            stop_flag: AtomicBool::new(false),
            run_lock: self
                .run_lock
                .unwrap_or_else(|| Arc::new(Mutex::new(()))),
            proc: Mutex::new(UnitProc {
                stop_result: None,
                payload: None,
            }),
            hooks: Hooks::new(),
            start_condition: self.start_condition.unwrap_or_else(always_pass),
            finish_condition: self.finish_condition.unwrap_or_else(always_pass),
            work: self.work.unwrap_or_else(always_pass),
            stop_process: self.stop_process,
        })
    }
}
