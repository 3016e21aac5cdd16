//! Lifecycle Hooks
//!
//! Every node exposes six multicast lifecycle hooks: start-async, started,
//! finished, stopping, stopped, and error-occurred. Hosts subscribe per node
//! instance and get invoked synchronously on the thread that triggered the
//! transition; composite runners rely on that ordering, so hook fan-out is
//! never deferred to another thread.
//!
//! A hook may fire while the raising node holds its internal process lock
//! (stop notifications do). Hook bodies must therefore not call control
//! operations (`start`, `stop`) back on the node that raised them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, Thread};

use chrono::{DateTime, Utc};
use log::warn;
use parking_lot::Mutex;

use crate::error::NodeError;
use crate::node::result::RunResult;

/// Token returned by a subscribe call; pass it back to unsubscribe.
pub type HookId = u64;

/// Arguments for the started / finished / stopping / stopped hooks.
#[derive(Clone, Debug)]
pub struct ProcArgs {
    /// Name of the node raising the event.
    pub name: String,
    /// Result associated with the transition; `None` for stopping, which
    /// fires before the stop-process has produced one.
    pub result: Option<RunResult>,
    /// When the event was raised.
    pub at: DateTime<Utc>,
}

/// Arguments for the start-async hook.
#[derive(Clone, Debug)]
pub struct AsyncArgs {
    /// Name of the node raising the event.
    pub name: String,
    /// Handle of the background thread the start call was launched on.
    pub thread: Thread,
    /// When the event was raised.
    pub at: DateTime<Utc>,
}

/// Arguments for the error-occurred hook.
#[derive(Clone, Debug)]
pub struct ErrorArgs {
    /// Name of the node raising the event.
    pub name: String,
    /// The caught fault.
    pub error: NodeError,
    /// When the event was raised.
    pub at: DateTime<Utc>,
}

/// One multicast listener list.
struct Listeners<A> {
    entries: Mutex<Vec<(HookId, Arc<dyn Fn(&A) + Send + Sync>)>>,
}

impl<A> Listeners<A> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: HookId, listener: Arc<dyn Fn(&A) + Send + Sync>) {
        self.entries.lock().push((id, listener));
    }

    fn remove(&self, id: HookId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Invokes every listener on the calling thread. The list is snapshotted
    /// first so a listener may subscribe or unsubscribe without deadlocking.
    fn emit(&self, args: &A) {
        let snapshot: Vec<Arc<dyn Fn(&A) + Send + Sync>> = self
            .entries
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        for listener in snapshot {
            listener(args);
        }
    }
}

/// The set of lifecycle hooks carried by one node.
pub struct Hooks {
    next_id: AtomicU64,
    start_async: Listeners<AsyncArgs>,
    started: Listeners<ProcArgs>,
    finished: Listeners<ProcArgs>,
    stopping: Listeners<ProcArgs>,
    stopped: Listeners<ProcArgs>,
    error: Listeners<ErrorArgs>,
}

impl Hooks {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            start_async: Listeners::new(),
            started: Listeners::new(),
            finished: Listeners::new(),
            stopping: Listeners::new(),
            stopped: Listeners::new(),
            error: Listeners::new(),
        }
    }

    fn next_id(&self) -> HookId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribes to the start-async event; fires when an asynchronous start
    /// has been launched, carrying the background thread's handle.
    pub fn on_start_async(&self, f: impl Fn(&AsyncArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.start_async.add(id, Arc::new(f));
        id
    }

    /// Subscribes to the started event.
    pub fn on_started(&self, f: impl Fn(&ProcArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.started.add(id, Arc::new(f));
        id
    }

    /// Subscribes to the finished event.
    pub fn on_finished(&self, f: impl Fn(&ProcArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.finished.add(id, Arc::new(f));
        id
    }

    /// Subscribes to the stopping event.
    pub fn on_stopping(&self, f: impl Fn(&ProcArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.stopping.add(id, Arc::new(f));
        id
    }

    /// Subscribes to the stopped event.
    pub fn on_stopped(&self, f: impl Fn(&ProcArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.stopped.add(id, Arc::new(f));
        id
    }

    /// Subscribes to the error-occurred event.
    pub fn on_error(&self, f: impl Fn(&ErrorArgs) + Send + Sync + 'static) -> HookId {
        let id = self.next_id();
        self.error.add(id, Arc::new(f));
        id
    }

    /// Removes a previously subscribed listener. Returns false if the token
    /// matched nothing.
    pub fn unsubscribe(&self, id: HookId) -> bool {
        self.start_async.remove(id)
            || self.started.remove(id)
            || self.finished.remove(id)
            || self.stopping.remove(id)
            || self.stopped.remove(id)
            || self.error.remove(id)
    }

    pub(crate) fn emit_start_async(&self, name: &str, handle: &JoinHandle<RunResult>) {
        self.start_async.emit(&AsyncArgs {
            name: name.to_string(),
            thread: handle.thread().clone(),
            at: Utc::now(),
        });
    }

    pub(crate) fn emit_started(&self, name: &str, result: Option<RunResult>) {
        self.started.emit(&Self::proc_args(name, result));
    }

    pub(crate) fn emit_finished(&self, name: &str, result: Option<RunResult>) {
        self.finished.emit(&Self::proc_args(name, result));
    }

    pub(crate) fn emit_stopping(&self, name: &str) {
        self.stopping.emit(&Self::proc_args(name, None));
    }

    pub(crate) fn emit_stopped(&self, name: &str, result: Option<RunResult>) {
        self.stopped.emit(&Self::proc_args(name, result));
    }

    pub(crate) fn emit_error(&self, name: &str, error: NodeError) {
        warn!("node `{}` raised error: {}", name, error);
        self.error.emit(&ErrorArgs {
            name: name.to_string(),
            error,
            at: Utc::now(),
        });
    }

    fn proc_args(name: &str, result: Option<RunResult>) -> ProcArgs {
        ProcArgs {
            name: name.to_string(),
            result,
            at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks").finish_non_exhaustive()
    }
}
