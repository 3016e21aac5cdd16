//! Shared Payload
//!
//! The payload is a string-keyed map of arbitrary values shared by reference
//! across every node in one run. The engine stores it and hands it to
//! condition/work callbacks; what goes in it and how concurrent mutation is
//! coordinated is up to the callbacks themselves; the engine only touches
//! it in [`Unit::update_payload`](crate::runner::Unit::update_payload).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

/// The raw key-value mapping inside a payload.
pub type PayloadMap = HashMap<String, Value>;

/// A payload shared by reference across all nodes in one run.
pub type Payload = Arc<RwLock<PayloadMap>>;

/// Creates an empty payload.
pub fn new_payload() -> Payload {
    Arc::new(RwLock::new(PayloadMap::new()))
}

/// Wraps an existing mapping into a shareable payload.
pub fn payload_from(map: PayloadMap) -> Payload {
    Arc::new(RwLock::new(map))
}
