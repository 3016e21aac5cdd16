//! Node Run States
//!
//! Every runnable node moves through the same lifecycle:
//! `Ready -> Running -> {Done | Stopped}`, with a transient `Stopping` state
//! entered only while a stop call is synchronously running its stop-process
//! hook. Nodes are single-use: starting a node that is not `Ready` fails
//! with a validation error and forces the state to `Stopped`.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a runnable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Constructed, not yet started.
    Ready,
    /// The start call is executing the node's body.
    Running,
    /// The body and finish-condition completed successfully.
    Done,
    /// A stop call is synchronously running the stop-process hook.
    Stopping,
    /// The node finished unsuccessfully or was stopped.
    Stopped,
    /// Reserved; no transition currently produces this state.
    Paused,
}

impl RunState {
    fn as_u8(self) -> u8 {
        match self {
            RunState::Ready => 0,
            RunState::Running => 1,
            RunState::Done => 2,
            RunState::Stopping => 3,
            RunState::Stopped => 4,
            RunState::Paused => 5,
        }
    }

    fn from_u8(raw: u8) -> RunState {
        match raw {
            0 => RunState::Ready,
            1 => RunState::Running,
            2 => RunState::Done,
            3 => RunState::Stopping,
            5 => RunState::Paused,
            _ => RunState::Stopped,
        }
    }
}

/// Lock-free cell holding a node's current [`RunState`].
///
/// Writes happen only while the owning node's process lock is held, so
/// transitions stay linearized; reads are unsynchronized on purpose so that
/// stop and admission paths can inspect a node's state without taking its
/// lock.
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new(state: RunState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub(crate) fn load(&self) -> RunState {
        RunState::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub(crate) fn store(&self, state: RunState) {
        self.0.store(state.as_u8(), Ordering::Relaxed);
    }
}

impl std::fmt::Debug for StateCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateCell({:?})", self.load())
    }
}
