//! Run Results
//!
//! Every execution step produces a [`RunResult`]: the originating node's
//! name, a non-owning back-reference to the node that produced it, a success
//! flag, and an ordered sequence of message strings. Results are the only
//! channel failures travel through; the engine never lets a fault escape a
//! start call.

use std::sync::{Arc, Weak};

use serde::Serialize;

use super::core::Node;

/// Structured outcome of one execution step.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunResult {
    /// Name of the node that produced this result.
    pub name: String,

    /// Non-owning back-reference to the producing node. Informational only:
    /// results routinely outlive the node, and nodes never own their
    /// results.
    #[serde(skip)]
    pub origin: Option<Weak<dyn Node>>,

    /// Whether the step succeeded.
    pub success: bool,

    /// Messages accumulated by the step, in production order.
    pub messages: Vec<String>,
}

impl RunResult {
    /// A successful result with no messages.
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A successful result carrying one message.
    pub fn ok_with(message: impl Into<String>) -> Self {
        Self {
            success: true,
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    /// A failed result carrying one message.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    /// A failed result carrying several messages.
    pub fn fail_all(messages: Vec<String>) -> Self {
        Self {
            success: false,
            messages,
            ..Self::default()
        }
    }

    /// Upgrades the back-reference, if the producing node is still alive.
    pub fn origin(&self) -> Option<Arc<dyn Node>> {
        self.origin.as_ref().and_then(Weak::upgrade)
    }

    /// Appends a pending stop-result onto this in-flight result: the stop
    /// messages follow the in-flight messages and the stop success flag
    /// overrides. An absent stop-result fails the merged result.
    pub(crate) fn absorb(&mut self, stop_result: Option<&RunResult>) {
        match stop_result {
            Some(stop) => {
                self.messages.extend(stop.messages.iter().cloned());
                self.success = stop.success;
            }
            None => self.success = false,
        }
    }
}
