//! The Node Contract
//!
//! Everything the engine can run (leaf units, staged pipelines, bounded
//! work queues) implements [`Node`]: an immutable name, a process-unique
//! id, a lifecycle state, a cooperative stop flag, lifecycle hooks, and the
//! start/stop operations. The pluggable behavior of a node is supplied as
//! condition/work functions with the fixed signature
//! `(node, payload) -> result`.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use log::error;
use once_cell::sync::Lazy;

use crate::error::NodeError;
use crate::node::hooks::Hooks;
use crate::node::payload::Payload;
use crate::node::result::RunResult;
use crate::node::state::RunState;

/// Process-unique identity of a node, assigned at construction.
pub type NodeId = u64;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Allocates the next node id.
pub(crate) fn next_node_id() -> NodeId {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A pluggable condition/work function: `(node, payload) -> result`.
///
/// The first argument is the node the function runs on behalf of; the second
/// is the payload shared across the run. Condition and work functions run
/// outside the node's internal locks and may block; stop-process functions
/// and queue intermediaries run under them and must not call control
/// operations back on the invoking node.
pub type NodeFn = dyn Fn(&dyn Node, &Payload) -> RunResult + Send + Sync;

/// Shared handle to a [`NodeFn`].
pub type SharedNodeFn = Arc<NodeFn>;

static ALWAYS_PASS: Lazy<SharedNodeFn> = Lazy::new(|| Arc::new(|_, _| RunResult::ok()));

/// The default start/finish condition: always succeeds with no messages.
pub(crate) fn always_pass() -> SharedNodeFn {
    Arc::clone(&ALWAYS_PASS)
}

/// Any runnable participant in the engine.
///
/// Nodes are single-use: once started, a second start fails with a
/// validation error. Composite runners hold shared references to their
/// children and drive their lifecycle without owning their construction.
pub trait Node: Send + Sync + 'static {
    /// The node's immutable name.
    fn name(&self) -> &str;

    /// The node's process-unique id.
    fn id(&self) -> NodeId;

    /// Current lifecycle state. Lock-free; safe to call from hooks and from
    /// work callbacks.
    fn state(&self) -> RunState;

    /// Whether a cooperative stop has been requested. Work callbacks poll
    /// this to honor cancellation between their own steps.
    fn stop_requested(&self) -> bool;

    /// The node's lifecycle hooks.
    fn hooks(&self) -> &Hooks;

    /// Runs the node to completion on the calling thread. Never panics past
    /// this boundary: every fault is converted into a failed result.
    fn start(&self, payload: Payload) -> RunResult;

    /// Launches [`start`](Node::start) on a background thread, emits the
    /// start-async notification carrying the thread handle, and returns the
    /// join handle.
    fn start_async(self: Arc<Self>, payload: Payload) -> JoinHandle<RunResult> {
        let runner = Arc::clone(&self);
        let handle = thread::spawn(move || runner.start(payload));
        self.hooks().emit_start_async(self.name(), &handle);
        handle
    }

    /// Requests a cooperative stop. On a node that is not running this flips
    /// the state straight to `Stopped`; on a running node it records the
    /// stop request, runs the stop-process hook, and lets the body observe
    /// the request at its next checkpoint.
    fn stop(&self);
}

/// Recovers a printable message from a panic payload.
fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&'static str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs a start body, converting any escaping panic into a failed result
/// published through the error hook. This is the boundary that guarantees
/// callers never need to catch anything from `start`.
pub(crate) fn run_guarded(
    name: &str,
    origin: Option<Weak<dyn Node>>,
    hooks: &Hooks,
    body: impl FnOnce() -> RunResult,
) -> RunResult {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => {
            let err = NodeError::Panicked {
                detail: panic_detail(payload),
            };
            error!("node `{}` aborted: {}", name, err);
            hooks.emit_error(name, err.clone());
            RunResult {
                name: name.to_string(),
                origin,
                success: false,
                messages: vec![err.to_string()],
            }
        }
    }
}
