//! One-shot node lock.
//!
//! A node is initialized or joined exactly once. Whichever of the init server
//! and the join client reaches [`NodeLock::try_lock_once`] first owns the
//! node's persistent state for the rest of the process lifetime; there is no
//! unlock.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct NodeLock {
    locked: AtomicBool,
}

impl NodeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the first caller only. Never blocks.
    pub fn try_lock_once(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }
}
