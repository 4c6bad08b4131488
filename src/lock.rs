//! Locks. Each arena is a monitor guarded by one `RecLock`; two further
//! process-wide locks order registry traversal and the fork protocol.
//!
//! Lock order, outermost first: global recursive lock, then the ring
//! lock, then any arena lock. Paths that need more than one always
//! claim in that order.

use std::sync::{Condvar, Mutex, Once, PoisonError};
use std::thread::{self, ThreadId};

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// A lock claimable either plainly or recursively. A plain claim on a
/// lock the caller already holds is a protocol violation and panics
/// rather than deadlocking.
pub struct RecLock {
    state: Mutex<LockState>,
    wait: Condvar,
}

impl RecLock {
    pub const fn new() -> RecLock {
        RecLock {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            wait: Condvar::new(),
        }
    }

    pub fn claim(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        assert!(state.owner != Some(me), "plain claim on a lock already held");
        while state.owner.is_some() {
            state = self.wait.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    pub fn claim_recursive(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.owner.is_some() {
            state = self.wait.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.owner, Some(me), "release by a thread not holding the lock");
        assert_eq!(state.depth, 1, "plain release of a recursively held lock");
        state.owner = None;
        state.depth = 0;
        drop(state);
        self.wait.notify_one();
    }

    pub fn release_recursive(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.owner, Some(me), "release by a thread not holding the lock");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.wait.notify_one();
        }
    }

    pub fn is_held(&self) -> bool {
        self.state.lock().unwrap().owner.is_some()
    }

    /// Reset the lock in place. A forked child inherits every lock in
    /// an undefined state; this puts it back to "free" regardless.
    pub fn reinit(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.owner = None;
        state.depth = 0;
        drop(state);
        self.wait.notify_all();
    }
}

// The global recursive lock (fork protocol) and the ring lock (arena
// registry). Kept distinct so that registry traversal never excludes a
// concurrent claim-all.
static GLOBAL_LOCK: RecLock = RecLock::new();
static RING_LOCK: RecLock = RecLock::new();

pub(crate) fn claim_ring() {
    RING_LOCK.claim();
}

pub(crate) fn release_ring() {
    RING_LOCK.release();
}

pub(crate) fn claim_global_recursive() {
    GLOBAL_LOCK.claim_recursive();
}

pub(crate) fn release_global_recursive() {
    GLOBAL_LOCK.release_recursive();
}

pub(crate) fn reinit_process_locks() {
    RING_LOCK.reinit();
    GLOBAL_LOCK.reinit();
}

static SETUP: Once = Once::new();

/// One-time lock setup, ordered after thread and protection setup so a
/// forked child sees locks claimed in "prepare" and released in
/// "parent" and "child".
pub(crate) fn lock_setup() {
    SETUP.call_once(|| {
        log::trace!(target: "quarry::event", "LockSetup");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn recursive_claim_nests() {
        let lock = RecLock::new();
        lock.claim_recursive();
        lock.claim_recursive();
        assert!(lock.is_held());
        lock.release_recursive();
        assert!(lock.is_held());
        lock.release_recursive();
        assert!(!lock.is_held());
    }

    #[test]
    fn reinit_frees_a_held_lock() {
        let lock = RecLock::new();
        lock.claim();
        lock.reinit();
        assert!(!lock.is_held());
        lock.claim();
        lock.release();
    }

    #[test]
    fn claim_excludes_other_threads() {
        let lock = Arc::new(RecLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..4 {
            let lock = lock.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    lock.claim();
                    let seen = counter.fetch_add(1, Ordering::Relaxed);
                    assert_eq!(counter.load(Ordering::Relaxed), seen + 1);
                    counter.fetch_sub(1, Ordering::Relaxed);
                    lock.release();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
