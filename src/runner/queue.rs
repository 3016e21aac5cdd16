//! Bounded Work Queue Runner
//!
//! A [`WorkQueue`] drains a FIFO of nodes under a concurrency cap. The drain
//! loop dequeues a node, closes the admission gate, launches the node on a
//! background thread, and blocks on the gate before it may dequeue again.
//! Whether the gate opens is decided by a four-state admission protocol
//! shared by two call sites:
//!
//! - **request-next**: a running node's own work asking permission to admit
//!   the next pending node concurrently with itself;
//! - **continuation**: fired automatically when a running node finishes.
//!
//! A running node may also park itself on the hold queue until a later
//! request-next or continuation releases it, and a stop call force-releases
//! any parked node rather than leaving it stranded. The [`next_caller`] and
//! [`holder`] builders package these checkpoints as ordinary [`Unit`]s that
//! can be spliced into a chain.
//!
//! A failed child stops the whole queue: running work completes, nothing new
//! is admitted, and the merged stop result is returned.
//!
//! [`next_caller`]: WorkQueue::next_caller
//! [`holder`]: WorkQueue::holder

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::node::core::{always_pass, next_node_id, run_guarded, Node, NodeId, SharedNodeFn};
use crate::node::hooks::Hooks;
use crate::node::payload::{new_payload, Payload};
use crate::node::result::RunResult;
use crate::node::state::{RunState, StateCell};
use crate::runner::gate::Gate;
use crate::runner::unit::Unit;

/// Admission-control state, shared by request-next and continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdmissionState {
    /// Capacity available; admission proceeds normally.
    Normal,
    /// Queue drained or stopping while the last running node completes.
    AtLast,
    /// Queue drained or stopping with more than one node still running.
    AtMid,
    /// The concurrency cap is reached.
    AtCapacity,
}

/// A parked node waiting on its private release gate.
struct HoldEntry {
    owner: NodeId,
    intermediary: Option<Arc<dyn Node>>,
    gate: Arc<Gate>,
}

struct QueueProc {
    stop_result: Option<RunResult>,
    payload: Option<Payload>,
    pending: VecDeque<Arc<dyn Node>>,
    running: Vec<Arc<dyn Node>>,
    holds: VecDeque<HoldEntry>,
    admission: AdmissionState,
    last_result: Option<RunResult>,
}

/// A node that drains a FIFO of children under a concurrency cap.
pub struct WorkQueue {
    name: String,
    id: NodeId,
    weak_self: Weak<WorkQueue>,
    state: StateCell,
    stop_flag: AtomicBool,
    run_lock: Arc<Mutex<()>>,
    max_running: usize,
    gate: Gate,
    proc: Mutex<QueueProc>,
    next_caller_lock: Arc<Mutex<()>>,
    hooks: Hooks,
    start_condition: SharedNodeFn,
    finish_condition: SharedNodeFn,
    stop_process: Option<SharedNodeFn>,
}

impl WorkQueue {
    /// Starts building a queue with the given name and concurrency cap.
    pub fn builder(name: impl Into<String>, max_running: usize) -> WorkQueueBuilder {
        WorkQueueBuilder::new(name, max_running)
    }

    /// A queue with no conditions.
    pub fn new(name: impl Into<String>, max_running: usize) -> Arc<WorkQueue> {
        WorkQueueBuilder::new(name, max_running).build()
    }

    /// Appends a node to the pending FIFO.
    pub fn enqueue(&self, node: Arc<dyn Node>) {
        self.proc.lock().pending.push_back(node);
    }

    /// Number of nodes still waiting to be admitted.
    pub fn pending_count(&self) -> usize {
        self.proc.lock().pending.len()
    }

    /// Number of nodes currently running.
    pub fn running_count(&self) -> usize {
        self.proc.lock().running.len()
    }

    /// The configured concurrency cap.
    pub fn max_running(&self) -> usize {
        self.max_running
    }

    /// Marks the queue stopping without touching already-running children:
    /// existing work completes, nothing new is admitted.
    pub fn stop_remaining(&self) {
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

    /// Builds a unit whose work asks the queue to admit the next pending
    /// node concurrently with the chain it is spliced into, optionally
    /// running `intermediary` first; stopping the unit stops the
    /// intermediary. All next-callers of one queue share an execution lock.
    pub fn next_caller(
        &self,
        current_name: &str,
        intermediary: Option<Arc<dyn Node>>,
    ) -> Arc<Unit> {
        let queue = self.weak_self.clone();
        let im_work = intermediary.clone();
        let im_stop = intermediary;

        Unit::builder(format!("{} next-caller", current_name))
            .work(move |_, _| match queue.upgrade() {
                Some(queue) => match queue.request_next(im_work.as_ref()) {
                    Ok(()) => RunResult::ok(),
                    Err(err) => RunResult::fail(err.to_string()),
                },
                None => RunResult::fail("queue no longer exists"),
            })
            .stop_process(move |_, _| {
                if let Some(node) = im_stop.as_ref() {
                    node.stop();
                }
                RunResult::fail_all(Vec::new())
            })
            .run_lock(Arc::clone(&self.next_caller_lock))
            .build()
    }

    /// Builds a unit whose work parks on the hold queue until a later
    /// request-next or continuation releases it; stopping the unit
    /// force-releases it instead.
    pub fn holder(&self, name: &str, intermediary: Option<Arc<dyn Node>>) -> Arc<Unit> {
        let queue_work = self.weak_self.clone();
        let queue_stop = self.weak_self.clone();

        Unit::builder(format!("{} holder", name))
            .work(move |node, _| {
                if let Some(queue) = queue_work.upgrade() {
                    queue.hold(node, intermediary.clone());
                }
                RunResult::ok()
            })
            .stop_process(move |node, _| {
                if let Some(queue) = queue_stop.upgrade() {
                    queue.unhold(node.id());
                }
                RunResult::fail_all(Vec::new())
            })
            .build()
    }

    /// The request-next admission step. Decided under the process lock:
    /// release the oldest parked hold entry, or record that the cap / the
    /// drained queue preempts the request, or run the intermediary and open
    /// the main gate for the next dequeue.
    fn request_next(&self, intermediary: Option<&Arc<dyn Node>>) -> Result<(), NodeError> {
        let mut proc = self.proc.lock();

        if let Some(entry) = proc.holds.pop_front() {
            proc.admission = AdmissionState::Normal;
            entry.gate.open();
            return Ok(());
        }
        if proc.running.len() >= self.max_running {
            proc.admission = AdmissionState::AtCapacity;
            return Ok(());
        }
        if proc.pending.is_empty() || self.stop_flag.load(Ordering::Relaxed) {
            proc.admission = AdmissionState::AtLast;
            return Ok(());
        }

        if let Some(node) = intermediary {
            debug!(
                "queue `{}` running request intermediary `{}`",
                self.name,
                node.name()
            );
            let payload = proc.payload.clone().unwrap_or_else(new_payload);
            if !node.start(payload).success {
                return Err(NodeError::Intermediary {
                    name: node.name().to_string(),
                });
            }
        }

        proc.admission = AdmissionState::Normal;
        self.gate.open();
        Ok(())
    }

    /// The continuation admission step, fired when a running node finishes.
    /// Mirrors request-next except that a released hold entry's intermediary
    /// runs first, and a drained queue distinguishes "last node done" (open
    /// the main gate so the drain loop observes termination) from "more
    /// still running".
    fn continue_next(&self) {
        let failed_intermediary: Option<String> = {
            let mut proc = self.proc.lock();

            if let Some(entry) = proc.holds.pop_front() {
                proc.admission = AdmissionState::Normal;
                let mut failed = None;
                if let Some(node) = entry.intermediary.as_ref() {
                    debug!(
                        "queue `{}` running hold intermediary `{}`",
                        self.name,
                        node.name()
                    );
                    let payload = proc.payload.clone().unwrap_or_else(new_payload);
                    if !node.start(payload).success {
                        failed = Some(node.name().to_string());
                    }
                }
                entry.gate.open();
                failed
            } else if proc.running.len() >= self.max_running {
                proc.admission = AdmissionState::AtCapacity;
                None
            } else if proc.pending.is_empty() || self.stop_flag.load(Ordering::Relaxed) {
                if proc.running.is_empty() {
                    proc.admission = AdmissionState::AtLast;
                    self.gate.open();
                } else {
                    proc.admission = AdmissionState::AtMid;
                }
                None
            } else {
                proc.admission = AdmissionState::Normal;
                self.gate.open();
                None
            }
        };

        if let Some(name) = failed_intermediary {
            // A failed hold intermediary leaves nothing to keep the run
            // coherent; tear the queue down and let the drain loop exit.
            self.hooks
                .emit_error(&self.name, NodeError::Intermediary { name });
            self.stop_with(false);
            self.gate.open();
        }
    }

    /// Parks the calling node until released, unless the admission state
    /// captured at call time has already superseded the wait.
    fn hold(&self, owner: &dyn Node, intermediary: Option<Arc<dyn Node>>) {
        let wait_gate = {
            let mut proc = self.proc.lock();
            if owner.state() != RunState::Running {
                return;
            }

            match proc.admission {
                AdmissionState::Normal => {
                    let gate = Arc::new(Gate::new(false));
                    proc.holds.push_back(HoldEntry {
                        owner: owner.id(),
                        intermediary,
                        gate: Arc::clone(&gate),
                    });
                    Some(gate)
                }
                AdmissionState::AtLast | AdmissionState::AtCapacity => {
                    proc.admission = AdmissionState::Normal;
                    None
                }
                AdmissionState::AtMid => {
                    // The queue already drained with others still running;
                    // run the intermediary inline instead of parking. Its
                    // result is deliberately not checked here.
                    if let Some(node) = intermediary.as_ref() {
                        let payload = proc.payload.clone().unwrap_or_else(new_payload);
                        let _ = node.start(payload);
                    }
                    proc.admission = AdmissionState::Normal;
                    None
                }
            }
        };

        if let Some(gate) = wait_gate {
            debug!("queue `{}` parked `{}`", self.name, owner.name());
            gate.wait();
        }
    }

    /// Force-releases the hold entry owned by the given node, regardless of
    /// admission state. Used by stop propagation so no thread stays parked
    /// while the queue is torn down.
    fn unhold(&self, owner: NodeId) {
        let proc = self.proc.lock();
        if let Some(entry) = proc.holds.iter().find(|entry| entry.owner == owner) {
            entry.gate.open();
        }
    }

    fn child_finished(&self, child: NodeId, result: RunResult) {
        let failed = !result.success;
        {
            let mut proc = self.proc.lock();
            proc.running.retain(|node| node.id() != child);
            proc.last_result = Some(result);
        }

        if failed {
            debug!("queue `{}` child failed, stopping queue", self.name);
            self.stop_with(false);
            self.gate.open();
        } else {
            self.continue_next();
        }
    }

    fn stop_with(&self, clear_stop_result: bool) {
        let to_stop: Vec<Arc<dyn Node>> = {
            let mut proc = self.proc.lock();
            match self.state.load() {
                // Already stopping: only re-forward to running children.
                RunState::Stopping => proc.running.iter().map(Arc::clone).collect(),
                RunState::Running => {
                    self.stop_flag.store(true, Ordering::Relaxed);
                    self.state.store(RunState::Stopping);
                    self.hooks.emit_stopping(&self.name);
                    let payload = proc.payload.clone().unwrap_or_else(new_payload);
                    proc.stop_result = self.stop_process.as_ref().map(|f| f(self, &payload));
                    proc.running.iter().map(Arc::clone).collect()
                }
                _ => {
                    self.state.store(RunState::Stopped);
                    self.stop_flag.store(true, Ordering::Relaxed);
                    if clear_stop_result {
                        proc.stop_result = None;
                    }
                    Vec::new()
                }
            }
        };

        // Forwarded outside the process lock: a child's stop-process may
        // call back into this queue (a parked holder releases itself).
        for node in to_stop {
            node.stop();
        }
    }

    fn origin(&self) -> Weak<dyn Node> {
        let weak: Weak<dyn Node> = self.weak_self.clone();
        weak
    }

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
            proc.running.clear();
            self.gate.open();

            if self.state.load() != RunState::Ready {
                self.state.store(RunState::Stopped);
                drop(proc);
                let result = self.tag(RunResult::fail(NodeError::NotReady.to_string()));
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }

            proc.stop_result = None;
            proc.last_result = None;
            proc.admission = AdmissionState::Normal;
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
            proc.last_result = Some(result.clone());
        }

        info!(
            "queue `{}` running, max {} concurrent",
            self.name, self.max_running
        );
        self.hooks
            .emit_started(&self.name, Some(self.tag(RunResult::ok())));

        loop {
            let node = {
                let mut proc = self.proc.lock();
                if self.stop_flag.load(Ordering::Relaxed) {
                    self.state.store(RunState::Stopped);
                    let mut merged = self.tag(proc.last_result.clone().unwrap_or_default());
                    merged.absorb(proc.stop_result.as_ref());
                    drop(proc);
                    return self.emit_stopped_and_finished(merged);
                }
                match proc.pending.pop_front() {
                    None => break,
                    Some(node) => {
                        self.gate.close();
                        proc.running.push(Arc::clone(&node));
                        node
                    }
                }
            };

            debug!("queue `{}` admitted `{}`", self.name, node.name());
            let child = node.id();
            let handle = Arc::clone(&node).start_async(Arc::clone(&payload));
            let queue = self.weak_self.clone();
            thread::spawn(move || {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| RunResult::fail("queued node thread panicked"));
                if let Some(queue) = queue.upgrade() {
                    queue.child_finished(child, result);
                }
            });

            self.gate.wait();
        }

        {
            let mut proc = self.proc.lock();
            if self.stop_flag.load(Ordering::Relaxed) {
                self.state.store(RunState::Stopped);
                let mut merged = self.tag(proc.last_result.clone().unwrap_or_default());
                merged.absorb(proc.stop_result.as_ref());
                drop(proc);
                return self.emit_stopped_and_finished(merged);
            }
        }

        let verdict = self.tag((self.finish_condition)(self, &payload));
        if !verdict.success {
            self.state.store(RunState::Stopped);
            return self.emit_stopped_and_finished(verdict);
        }

        self.state.store(RunState::Done);
        info!("queue `{}` drained", self.name);
        let result = self.tag(self.proc.lock().last_result.clone().unwrap_or_default());
        self.hooks.emit_finished(&self.name, Some(result.clone()));
        result
    }
}

impl Node for WorkQueue {
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

    /// Stops the queue and forwards the stop to every currently-running
    /// child. On an already-stopping queue this only re-forwards, without
    /// re-running the stop-process.
    fn stop(&self) {
        self.stop_with(true);
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("state", &self.state.load())
            .field("max_running", &self.max_running)
            .finish_non_exhaustive()
    }
}

/// Builder for [`WorkQueue`]. The concurrency cap is required; everything
/// else defaults like a [`Unit`].
pub struct WorkQueueBuilder {
    name: String,
    max_running: usize,
    start_condition: Option<SharedNodeFn>,
    finish_condition: Option<SharedNodeFn>,
    stop_process: Option<SharedNodeFn>,
    run_lock: Option<Arc<Mutex<()>>>,
}

impl WorkQueueBuilder {
    fn new(name: impl Into<String>, max_running: usize) -> Self {
        Self {
            name: name.into(),
            max_running,
            start_condition: None,
            finish_condition: None,
            stop_process: None,
            run_lock: None,
        }
    }

    /// Condition evaluated before the drain loop starts.
    pub fn start_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.start_condition = Some(Arc::new(f));
        self
    }

    /// Condition evaluated after the queue drains successfully.
    pub fn finish_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.finish_condition = Some(Arc::new(f));
        self
    }

    /// Compensating hook run synchronously when the queue is stopped while
    /// running.
    pub fn stop_process(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.stop_process = Some(Arc::new(f));
        self
    }

    /// Execution lock serializing the queue's start call.
    pub fn run_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = Some(lock);
        self
    }

    /// Finishes the build.
    pub fn build(self) -> Arc<WorkQueue> {
        Arc::new_cyclic(|weak| WorkQueue {
            name: self.name,
            id: next_node_id(),
            weak_self: weak.clone(),
            state: StateCell::new(RunState::Ready),
            stop_flag: AtomicBool::new(false),
            run_lock: self
                .run_lock
                .unwrap_or_else(|| Arc::new(Mutex::new(()))),
            max_running: self.max_running,
            gate: Gate::new(true),
            proc: Mutex::new(QueueProc {
                stop_result: None,
                payload: None,
                pending: VecDeque::new(),
                running: Vec::new(),
                holds: VecDeque::new(),
                admission: AdmissionState::Normal,
                last_result: None,
            }),
            next_caller_lock: Arc::new(Mutex::new(())),
            hooks: Hooks::new(),
            start_condition: self.start_condition.unwrap_or_else(always_pass),
            finish_condition: self.finish_condition.unwrap_or_else(always_pass),
            stop_process: self.stop_process,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn wait_until(what: &str, predicate: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !predicate() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Spin inside a work callback until the flag is set, failing the unit
    /// instead of hanging the test if it never is.
    fn await_flag(flag: &AtomicBool, what: &str) -> Result<(), RunResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !flag.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return Err(RunResult::fail(format!("timed out waiting for {}", what)));
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(())
    }

    #[test]
    fn test_drains_fifo_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let queue = WorkQueue::new("serial", 2);

        for index in 0..5 {
            let order = Arc::clone(&order);
            queue.enqueue(Unit::new(format!("n{}", index), move |_, _| {
                order.lock().push(index);
                RunResult::ok()
            }));
        }

        let result = queue.start(new_payload());

        assert!(result.success);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.state(), RunState::Done);
        assert_eq!(queue.pending_count(), 0);
        assert_eq!(queue.running_count(), 0);
    }

    #[test]
    fn test_request_next_respects_concurrency_cap() {
        let queue = WorkQueue::new("capped", 2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        for index in 0..5 {
            let queue_ref = Arc::downgrade(&queue);
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let completed = Arc::clone(&completed);
            queue.enqueue(Unit::new(format!("w{}", index), move |_, _| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let queue = queue_ref.upgrade().unwrap();
                queue.request_next(None).unwrap();
                thread::sleep(Duration::from_millis(10));

                active.fetch_sub(1, Ordering::SeqCst);
                completed.fetch_add(1, Ordering::SeqCst);
                RunResult::ok()
            }));
        }

        let result = queue.start(new_payload());

        assert!(result.success);
        assert_eq!(completed.load(Ordering::SeqCst), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded");
        assert_eq!(queue.state(), RunState::Done);
    }

    #[test]
    fn test_holder_parks_until_continuation_releases() {
        let queue = WorkQueue::new("holding", 2);
        let released = Arc::new(AtomicBool::new(false));

        let queue_ref = Arc::downgrade(&queue);
        let opener = Unit::new("opener", move |_, _| {
            let queue = queue_ref.upgrade().unwrap();
            queue.request_next(None).unwrap();
            // Finish only after the holder is parked so our completion
            // continuation is what releases it.
            let deadline = Instant::now() + Duration::from_secs(5);
            while queue.proc.lock().holds.is_empty() {
                if Instant::now() >= deadline {
                    return RunResult::fail("holder never parked");
                }
                thread::sleep(Duration::from_millis(1));
            }
            RunResult::ok()
        });

        let holder = queue.holder("pause", None);
        let holder_result = Arc::clone(&released);
        holder.hooks().on_finished(move |args| {
            if args.result.as_ref().is_some_and(|r| r.success) {
                holder_result.store(true, Ordering::SeqCst);
            }
        });

        queue.enqueue(opener);
        queue.enqueue(holder);
        let result = queue.start(new_payload());

        assert!(result.success);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(queue.state(), RunState::Done);
    }

    #[test]
    fn test_stop_releases_parked_holder() {
        let queue = WorkQueue::new("teardown", 2);
        let holder_returned = Arc::new(AtomicBool::new(false));

        let queue_ref = Arc::downgrade(&queue);
        let opener = Unit::new("opener", move |node, _| {
            let queue = queue_ref.upgrade().unwrap();
            queue.request_next(None).unwrap();
            while !node.stop_requested() {
                thread::sleep(Duration::from_millis(1));
            }
            RunResult::ok()
        });

        let holder = queue.holder("stuck", None);
        let flag = Arc::clone(&holder_returned);
        holder.hooks().on_finished(move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        queue.enqueue(opener);
        queue.enqueue(Arc::clone(&holder) as Arc<dyn Node>);
        let handle = Arc::clone(&queue).start_async(new_payload());

        wait_until("holder parked", || !queue.proc.lock().holds.is_empty());
        queue.stop();

        let result = handle.join().unwrap();
        assert!(!result.success);
        assert!(holder_returned.load(Ordering::SeqCst));
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_failing_child_stops_queue() {
        let queue = WorkQueue::new("fallible", 1);
        let later_runs = Arc::new(AtomicUsize::new(0));

        queue.enqueue(Unit::new("bad", |_, _| RunResult::fail("bad news")));
        let counter = Arc::clone(&later_runs);
        queue.enqueue(Unit::new("good", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunResult::ok()
        }));

        let result = queue.start(new_payload());

        assert!(!result.success);
        assert_eq!(result.messages, vec!["bad news"]);
        assert_eq!(later_runs.load(Ordering::SeqCst), 0);
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_stop_remaining_lets_running_work_finish() {
        let queue = WorkQueue::builder("winding-down", 1)
            .stop_process(|_, _| RunResult::fail("halted"))
            .build();
        let release = Arc::new(AtomicBool::new(false));
        let second_runs = Arc::new(AtomicUsize::new(0));

        let gate = Arc::clone(&release);
        let first = Unit::new("first", move |_, _| match await_flag(&gate, "release") {
            Ok(()) => RunResult::ok_with("first done"),
            Err(fail) => fail,
        });
        let first_probe = Arc::clone(&first);

        let counter = Arc::clone(&second_runs);
        queue.enqueue(first);
        queue.enqueue(Unit::new("second", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunResult::ok()
        }));

        let handle = Arc::clone(&queue).start_async(new_payload());
        wait_until("first running", || first_probe.state() == RunState::Running);

        queue.stop_remaining();
        release.store(true, Ordering::SeqCst);

        let result = handle.join().unwrap();

        // The running node finished untouched; nothing new was admitted.
        assert_eq!(first_probe.state(), RunState::Done);
        assert_eq!(second_runs.load(Ordering::SeqCst), 0);
        assert!(!result.success);
        assert!(result.messages.contains(&"halted".to_string()));
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_double_stop_runs_stop_process_once() {
        let stop_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stop_count);
        let queue = WorkQueue::builder("twice-stopped", 1)
            .stop_process(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                RunResult::fail("q-halt")
            })
            .build();

        let release = Arc::new(AtomicBool::new(false));
        let child_stops = Arc::new(AtomicUsize::new(0));

        let gate = Arc::clone(&release);
        let child_counter = Arc::clone(&child_stops);
        let child = Unit::builder("slow")
            .work(move |_, _| match await_flag(&gate, "release") {
                Ok(()) => RunResult::ok_with("c done"),
                Err(fail) => fail,
            })
            .stop_process(move |_, _| {
                child_counter.fetch_add(1, Ordering::SeqCst);
                RunResult::ok()
            })
            .build();
        let child_probe = Arc::clone(&child);

        queue.enqueue(child);
        let handle = Arc::clone(&queue).start_async(new_payload());
        wait_until("child running", || child_probe.state() == RunState::Running);

        queue.stop();
        assert_eq!(queue.state(), RunState::Stopping);
        queue.stop();

        // Second stop re-forwarded to the running child (flipping it from
        // Stopping to Stopped) without re-running the queue's stop-process.
        assert_eq!(stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(child_stops.load(Ordering::SeqCst), 1);
        assert_eq!(child_probe.state(), RunState::Stopped);

        release.store(true, Ordering::SeqCst);
        let result = handle.join().unwrap();

        assert!(!result.success);
        assert!(result.messages.contains(&"q-halt".to_string()));
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_hold_after_capacity_preemption_returns_immediately() {
        let queue = WorkQueue::new("preempted", 1);

        let queue_ref = Arc::downgrade(&queue);
        queue.enqueue(Unit::new("solo", move |node, _| {
            let queue = queue_ref.upgrade().unwrap();
            // At cap: the request is recorded as preempted, so the
            // following hold must not park.
            queue.request_next(None).unwrap();
            queue.hold(node, None);
            RunResult::ok_with("never parked")
        }));

        let result = queue.start(new_payload());

        assert!(result.success);
        assert_eq!(result.messages, vec!["never parked"]);
        assert_eq!(queue.state(), RunState::Done);
    }

    #[test]
    fn test_hold_after_drain_runs_intermediary_inline() {
        let queue = WorkQueue::new("tail", 2);
        let intermediary_runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&intermediary_runs);
        let intermediary = Unit::new("announce", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            RunResult::ok()
        });

        let queue_ref = Arc::downgrade(&queue);
        let opener = Unit::new("opener", move |_, _| {
            let queue = queue_ref.upgrade().unwrap();
            queue.request_next(None).unwrap();
            // Stay running until the tail worker is admitted, so our own
            // completion finds it in the running set.
            let deadline = Instant::now() + Duration::from_secs(5);
            while queue.running_count() < 2 {
                if Instant::now() >= deadline {
                    return RunResult::fail("tail worker never admitted");
                }
                thread::sleep(Duration::from_millis(1));
            }
            RunResult::ok()
        });
        let opener_probe = Arc::clone(&opener);

        let queue_ref = Arc::downgrade(&queue);
        let tail = Unit::new("tail-worker", move |node, _| {
            // Wait for the opener's whole lifecycle first; whichever side of
            // the continuation race we land on, the intermediary runs once.
            let deadline = Instant::now() + Duration::from_secs(5);
            while opener_probe.state() != RunState::Done {
                if Instant::now() >= deadline {
                    return RunResult::fail("opener never finished");
                }
                thread::sleep(Duration::from_millis(1));
            }
            let queue = queue_ref.upgrade().unwrap();
            queue.hold(node, Some(Arc::clone(&intermediary) as Arc<dyn Node>));
            RunResult::ok()
        });

        queue.enqueue(opener);
        queue.enqueue(tail);
        let result = queue.start(new_payload());

        assert!(result.success, "messages: {:?}", result.messages);
        assert_eq!(intermediary_runs.load(Ordering::SeqCst), 1);
        assert_eq!(queue.state(), RunState::Done);
    }

    #[test]
    fn test_next_caller_runs_intermediary_before_admission() {
        let queue = WorkQueue::new("spliced", 2);
        let events = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&events);
        let intermediary = Unit::new("prep", move |_, _| {
            sink.lock().push("prep");
            RunResult::ok()
        });

        let caller = queue.next_caller("head", Some(intermediary));
        let sink = Arc::clone(&events);
        let follower = Unit::new("follower", move |_, _| {
            sink.lock().push("follower");
            RunResult::ok()
        });

        queue.enqueue(caller);
        queue.enqueue(follower);
        let result = queue.start(new_payload());

        assert!(result.success);
        assert_eq!(*events.lock(), vec!["prep", "follower"]);
        assert_eq!(queue.state(), RunState::Done);
    }

    #[test]
    fn test_next_caller_stop_forwards_to_intermediary() {
        let queue = WorkQueue::new("relay-stop", 2);

        // The intermediary runs until stopped; while it runs, the adapter is
        // mid-work, so stopping the adapter exercises its stop-process.
        let intermediary = Unit::new("attached", |node, _| {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !node.stop_requested() {
                if Instant::now() >= deadline {
                    return RunResult::fail("never stopped");
                }
                thread::sleep(Duration::from_millis(1));
            }
            RunResult::ok()
        });
        let probe = Arc::clone(&intermediary);

        let caller = queue.next_caller("head", Some(intermediary as Arc<dyn Node>));
        let caller_probe = Arc::clone(&caller);
        queue.enqueue(caller);
        queue.enqueue(Unit::new("follower", |_, _| RunResult::ok()));

        let handle = Arc::clone(&queue).start_async(new_payload());
        wait_until("intermediary running", || {
            probe.state() == RunState::Running
        });

        caller_probe.stop();
        let result = handle.join().unwrap();

        assert_eq!(probe.state(), RunState::Stopped);
        assert!(!result.success);
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_second_start_is_validation_failure() {
        let queue = WorkQueue::new("reused", 1);
        queue.enqueue(Unit::new("only", |_, _| RunResult::ok()));

        assert!(queue.start(new_payload()).success);
        let second = queue.start(new_payload());

        assert!(!second.success);
        assert_eq!(second.messages, vec!["No Ready state"]);
        assert_eq!(queue.state(), RunState::Stopped);
    }

    #[test]
    fn test_stop_on_ready_queue_skips_stop_process() {
        let stop_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stop_count);
        let queue = WorkQueue::builder("untouched", 1)
            .stop_process(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                RunResult::ok()
            })
            .build();

        queue.stop();

        assert_eq!(queue.state(), RunState::Stopped);
        assert_eq!(stop_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_queue_succeeds() {
        let queue = WorkQueue::new("idle", 3);
        let result = queue.start(new_payload());

        assert!(result.success);
        assert_eq!(queue.state(), RunState::Done);
    }
}
