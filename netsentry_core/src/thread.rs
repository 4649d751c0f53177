//! Per-thread caller context.
//!
//! Every lock and dispatch call borrows one of these. Passing `None`
//! instead marks the caller as anonymous (interrupt-style): it has no
//! identity, cannot hold shared locks, and may only nest an exclusive hold
//! through `LockFlags::RETAIN_SEMAPHORE`.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::ThreadFlags;

/// Process-unique caller identity.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

static NEXT_CALLER_ID: AtomicU64 = AtomicU64::new(1);

/// Owned by exactly one OS thread; deliberately `!Sync`.
#[derive(Debug)]
pub struct ThreadContext {
    id: CallerId,
    deadline: Cell<Option<Instant>>,
    flags: Cell<ThreadFlags>,
    held_locks: Cell<u32>,
}

impl ThreadContext {
    pub fn new() -> Self {
        Self::with_flags(ThreadFlags::NONE)
    }

    pub fn with_flags(flags: ThreadFlags) -> Self {
        Self {
            id: CallerId(NEXT_CALLER_ID.fetch_add(1, Ordering::Relaxed)),
            deadline: Cell::new(None),
            flags: Cell::new(flags),
            held_locks: Cell::new(0),
        }
    }

    pub fn id(&self) -> CallerId {
        self.id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    /// Standing deadline applied to every subsequent wait on this thread.
    pub fn set_deadline_rel(&self, after: Duration) {
        self.deadline.set(Some(Instant::now() + after));
    }

    pub fn set_deadline_abs(&self, at: Instant) {
        self.deadline.set(Some(at));
    }

    pub fn clear_deadline(&self) {
        self.deadline.set(None);
    }

    pub fn flags(&self) -> ThreadFlags {
        self.flags.get()
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.get().contains(ThreadFlags::READ_ONLY)
    }

    pub fn set_readonly(&self) {
        let mut f = self.flags.get();
        f.insert(ThreadFlags::READ_ONLY);
        self.flags.set(f);
    }

    pub fn set_readwrite(&self) {
        let mut f = self.flags.get();
        f.remove(ThreadFlags::READ_ONLY);
        self.flags.set(f);
    }

    /// Distinct holds (shared or exclusive) this thread owns right now.
    pub fn held_locks(&self) -> u32 {
        self.held_locks.get()
    }

    pub(crate) fn note_acquired(&self) {
        self.held_locks.set(self.held_locks.get() + 1);
    }

    pub(crate) fn note_released(&self) {
        self.held_locks.set(self.held_locks.get().saturating_sub(1));
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_flags_toggle() {
        let a = ThreadContext::new();
        let b = ThreadContext::new();
        assert_ne!(a.id(), b.id());

        a.set_readonly();
        assert!(a.is_readonly());
        a.set_readwrite();
        assert!(!a.is_readonly());

        a.set_deadline_rel(Duration::from_secs(5));
        assert!(a.deadline().is_some());
        a.clear_deadline();
        assert!(a.deadline().is_none());
    }
}
