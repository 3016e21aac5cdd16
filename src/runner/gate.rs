//! Manual-Reset Gate
//!
//! A binary signal threads can block on: open lets every waiter through
//! (and stays open), close makes the next waiter block. The queue runner
//! uses one gate to pace its drain loop and a private gate per parked hold
//! entry.

use parking_lot::{Condvar, Mutex};

/// A manual-reset, condvar-backed gate.
pub(crate) struct Gate {
    open: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    pub(crate) fn new(open: bool) -> Self {
        Self {
            open: Mutex::new(open),
            signal: Condvar::new(),
        }
    }

    /// Opens the gate and wakes every waiter. The gate stays open until the
    /// next close.
    pub(crate) fn open(&self) {
        let mut open = self.open.lock();
        *open = true;
        self.signal.notify_all();
    }

    /// Closes the gate; subsequent waits block until the next open.
    pub(crate) fn close(&self) {
        *self.open.lock() = false;
    }

    /// Blocks the calling thread until the gate is open.
    pub(crate) fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.signal.wait(&mut open);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        *self.open.lock()
    }
}
