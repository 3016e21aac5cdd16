//! Node Contract and Data Model
//!
//! The shared vocabulary of the engine:
//!
//! - [`Node`]: the contract every runnable participant implements
//! - [`RunState`]: the lifecycle state machine
//! - [`RunResult`]: the structured outcome of every execution step
//! - [`Payload`]: the key-value store shared by reference across one run
//! - [`Hooks`]: multicast lifecycle notifications

pub mod core;
pub mod hooks;
pub mod payload;
pub mod result;
pub mod state;

pub use self::core::{Node, NodeFn, NodeId, SharedNodeFn};
pub use self::hooks::{AsyncArgs, ErrorArgs, HookId, Hooks, ProcArgs};
pub use self::payload::{new_payload, payload_from, Payload, PayloadMap};
pub use self::result::RunResult;
pub use self::state::RunState;
