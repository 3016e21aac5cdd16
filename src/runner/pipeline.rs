//! Staged Pipeline Runner
//!
//! A [`Pipeline`] runs an ordered sequence of stages. Every sibling in a
//! stage is launched concurrently; the stage's await-set is joined before
//! the next stage starts. A sibling added with a defer level `k` is launched
//! with its stage but joined `k` generations later (clamped to the last
//! stage), which allows "fire here, join later" fan-out across uneven
//! pipelines.
//!
//! A failed sibling aborts the run: the failing siblings' messages are
//! aggregated into one failure result and later stages never start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

use log::{debug, info};
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::node::core::{always_pass, next_node_id, run_guarded, Node, NodeId, SharedNodeFn};
use crate::node::hooks::Hooks;
use crate::node::payload::{new_payload, Payload};
use crate::node::result::RunResult;
use crate::node::state::{RunState, StateCell};

/// One sibling within a stage: the node plus its defer level.
#[derive(Clone)]
struct StageEntry {
    node: Arc<dyn Node>,
    defer: usize,
}

struct PipeProc {
    stop_result: Option<RunResult>,
    payload: Option<Payload>,
    stages: Vec<Vec<StageEntry>>,
    current: usize,
}

/// A node that runs its children in staged generations.
pub struct Pipeline {
    name: String,
    id: NodeId,
    weak_self: Weak<Pipeline>,
    state: StateCell,
    stop_flag: AtomicBool,
    run_lock: Arc<Mutex<()>>,
    proc: Mutex<PipeProc>,
    hooks: Hooks,
    start_condition: SharedNodeFn,
    finish_condition: SharedNodeFn,
    stop_process: Option<SharedNodeFn>,
}

impl Pipeline {
    /// Starts building a pipeline with the given name.
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    /// A pipeline with no conditions and no stages yet.
    pub fn new(name: impl Into<String>) -> Arc<Pipeline> {
        PipelineBuilder::new(name).build()
    }

    /// Appends one node as a stage of its own.
    pub fn push(&self, node: Arc<dyn Node>) {
        self.proc
            .lock()
            .stages
            .push(vec![StageEntry { node, defer: 0 }]);
    }

    /// Appends each node as a stage of its own, in order.
    pub fn push_serial(&self, nodes: impl IntoIterator<Item = Arc<dyn Node>>) {
        let mut proc = self.proc.lock();
        for node in nodes {
            proc.stages.push(vec![StageEntry { node, defer: 0 }]);
        }
    }

    /// Appends one stage of concurrently running siblings.
    pub fn push_stage(&self, nodes: Vec<Arc<dyn Node>>) {
        self.proc.lock().stages.push(
            nodes
                .into_iter()
                .map(|node| StageEntry { node, defer: 0 })
                .collect(),
        );
    }

    /// Appends one stage of siblings with explicit defer levels: a sibling
    /// with defer `k` is launched with this stage but joined `k` generations
    /// later.
    pub fn push_stage_deferred(&self, nodes: Vec<(Arc<dyn Node>, usize)>) {
        self.proc.lock().stages.push(
            nodes
                .into_iter()
                .map(|(node, defer)| StageEntry { node, defer })
                .collect(),
        );
    }

    /// Snapshot of the current stage layout.
    pub fn stages(&self) -> Vec<Vec<Arc<dyn Node>>> {
        self.proc
            .lock()
            .stages
            .iter()
            .map(|stage| stage.iter().map(|entry| Arc::clone(&entry.node)).collect())
            .collect()
    }

    /// Replaces the stage layout wholesale; defer levels reset to zero.
    pub fn set_stages(&self, stages: Vec<Vec<Arc<dyn Node>>>) {
        self.proc.lock().stages = stages
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .map(|node| StageEntry { node, defer: 0 })
                    .collect()
            })
            .collect();
    }

    /// Index of the stage currently being driven.
    pub fn current_stage(&self) -> usize {
        self.proc.lock().current
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
        let stages = {
            let mut proc = self.proc.lock();
            proc.payload = Some(Arc::clone(&payload));

            if self.state.load() != RunState::Ready {
                self.state.store(RunState::Stopped);
                drop(proc);
                let result = self.tag(RunResult::fail(NodeError::NotReady.to_string()));
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }

            if proc.stages.iter().any(Vec::is_empty) {
                self.state.store(RunState::Stopped);
                drop(proc);
                let result = self.tag(RunResult::fail(NodeError::EmptyStage.to_string()));
                self.hooks.emit_stopped(&self.name, Some(result.clone()));
                return result;
            }

            proc.current = 0;
            proc.stop_result = None;
            proc.stages.clone()
        };

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

        info!("pipeline `{}` running {} stages", self.name, stages.len());
        self.hooks
            .emit_started(&self.name, Some(self.tag(RunResult::ok())));

        let stage_count = stages.len();
        let mut await_sets: Vec<Vec<JoinHandle<RunResult>>> =
            (0..stage_count).map(|_| Vec::new()).collect();

        for index in 0..stage_count {
            {
                let mut proc = self.proc.lock();
                proc.current = index;
                if self.stop_flag.load(Ordering::Relaxed) {
                    self.state.store(RunState::Stopped);
                    result.absorb(proc.stop_result.as_ref());
                    drop(proc);
                    return self.emit_stopped_and_finished(result);
                }
            }

            for entry in &stages[index] {
                // A deferred sibling is launched now but joined later.
                let slot = (index + entry.defer).min(stage_count - 1);
                await_sets[slot].push(Arc::clone(&entry.node).start_async(Arc::clone(&payload)));
            }
            debug!("pipeline `{}` awaiting generation {}", self.name, index);

            let awaited: Vec<RunResult> = await_sets[index]
                .drain(..)
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| RunResult::fail("stage worker thread panicked"))
                })
                .collect();

            let failing: Vec<&RunResult> = awaited.iter().filter(|r| !r.success).collect();
            if !failing.is_empty() {
                let messages = failing
                    .iter()
                    .flat_map(|r| r.messages.iter().cloned())
                    .collect();
                let failed = self.tag(RunResult::fail_all(messages));
                self.state.store(RunState::Stopped);
                return self.emit_stopped_and_finished(failed);
            }

            result.success = true;
            result
                .messages
                .extend(awaited.iter().flat_map(|r| r.messages.iter().cloned()));
        }

        {
            let mut proc = self.proc.lock();
            if self.stop_flag.load(Ordering::Relaxed) {
                self.state.store(RunState::Stopped);
                result.absorb(proc.stop_result.as_ref());
                drop(proc);
                return self.emit_stopped_and_finished(result);
            }
        }

        let verdict = self.tag((self.finish_condition)(self, &payload));
        if !verdict.success {
            self.state.store(RunState::Stopped);
            return self.emit_stopped_and_finished(verdict);
        }

        self.state.store(RunState::Done);
        info!("pipeline `{}` done", self.name);
        self.hooks.emit_finished(&self.name, Some(result.clone()));
        result
    }
}

impl Node for Pipeline {
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

    /// Forwards the stop to every sibling in stages zero through the current
    /// stage inclusive; stages not yet reached are left untouched.
    fn stop(&self) {
        let to_stop: Vec<Arc<dyn Node>> = {
            let mut proc = self.proc.lock();
            if self.state.load() != RunState::Running {
                self.state.store(RunState::Stopped);
                self.stop_flag.store(true, Ordering::Relaxed);
                proc.stop_result = None;
                return;
            }

            self.stop_flag.store(true, Ordering::Relaxed);
            self.state.store(RunState::Stopping);
            self.hooks.emit_stopping(&self.name);
            let payload = proc.payload.clone().unwrap_or_else(new_payload);
            proc.stop_result = self.stop_process.as_ref().map(|f| f(self, &payload));

            let reached = proc.current;
            proc.stages
                .iter()
                .take(reached + 1)
                .flat_map(|stage| stage.iter().map(|entry| Arc::clone(&entry.node)))
                .collect()
        };

        // Forwarded outside the process lock; propagation is best-effort and
        // a child's stop-process may call back into shared infrastructure.
        for node in to_stop {
            node.stop();
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("state", &self.state.load())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    name: String,
    start_condition: Option<SharedNodeFn>,
    finish_condition: Option<SharedNodeFn>,
    stop_process: Option<SharedNodeFn>,
    run_lock: Option<Arc<Mutex<()>>>,
}

impl PipelineBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_condition: None,
            finish_condition: None,
            stop_process: None,
            run_lock: None,
        }
    }

    /// Condition evaluated before any stage launches.
    pub fn start_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.start_condition = Some(Arc::new(f));
        self
    }

    /// Condition evaluated after the final stage succeeds.
    pub fn finish_condition(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.finish_condition = Some(Arc::new(f));
        self
    }

    /// Compensating hook run synchronously by a stop call while running.
    pub fn stop_process(
        mut self,
        f: impl Fn(&dyn Node, &Payload) -> RunResult + Send + Sync + 'static,
    ) -> Self {
        self.stop_process = Some(Arc::new(f));
        self
    }

    /// Execution lock serializing the pipeline's start call.
    pub fn run_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.run_lock = Some(lock);
        self
    }

    /// Finishes the build.
    pub fn build(self) -> Arc<Pipeline> {
        Arc::new_cyclic(|weak| Pipeline {
            name: self.name,
            id: next_node_id(),
            weak_self: weak.clone(),
            state: StateCell::new(RunState::Ready),
            stop_flag: AtomicBool::new(false),
            run_lock: self
                .run_lock
                .unwrap_or_else(|| Arc::new(Mutex::new(()))),
            proc: Mutex::new(PipeProc {
                stop_result: None,
                payload: None,
                stages: Vec::new(),
                current: 0,
            }),
            hooks: Hooks::new(),
            start_condition: self.start_condition.unwrap_or_else(always_pass),
            finish_condition: self.finish_condition.unwrap_or_else(always_pass),
            stop_process: self.stop_process,
        })
    }
}
