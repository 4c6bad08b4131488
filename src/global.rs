//! The process-wide arena registry: a ring of all live arenas, the
//! serial counter, and the operations that walk the ring: access-fault
//! dispatch and the fork claim/release/reinitialize protocol.
//!
//! The ring and the serial counter are guarded by the ring lock; the
//! recursive global lock is claimed around whole-process operations.
//! Lock order is global lock, then ring lock, then any arena lock.

use crate::arena::ArenaShared;
use crate::lock;
use crate::set::AccessSet;
use crate::tract::Addr;
use std::cell::UnsafeCell;
use std::sync::{Arc, OnceLock};

struct Registry {
    // Guarded by the ring lock, not a Mutex of its own, so the claim
    // order stays visible at every use.
    ring: UnsafeCell<Vec<Arc<ArenaShared>>>,
    serial: UnsafeCell<u64>,
}

unsafe impl Sync for Registry {}
unsafe impl Send for Registry {}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        ring: UnsafeCell::new(Vec::new()),
        serial: UnsafeCell::new(0),
    })
}

/// One-time process setup, run before the first arena exists. The
/// setup calls are ordered so fork handlers take locks first in
/// "prepare" and release them last in "parent" and "child".
pub(crate) fn ensure_setup() {
    registry();
    thread_setup();
    prot_setup();
    lock::lock_setup();
}

fn thread_setup() {
    // Thread suspension hooks would be installed here; the portable
    // build has none.
}

fn prot_setup() {
    // Likewise for platform protection handlers.
}

/// Assign the next arena serial, ordered by the ring lock.
pub(crate) fn assign_serial() -> u64 {
    let registry = registry();
    lock::claim_ring();
    let serial = unsafe {
        let counter = &mut *registry.serial.get();
        let serial = *counter;
        *counter += 1;
        serial
    };
    lock::release_ring();
    serial
}

/// Append a new arena to the ring. The arena's globals are fully
/// initialized by now; its lock is held across the append so no fault
/// dispatch can see it half-made.
pub(crate) fn announce(shared: &Arc<ArenaShared>) {
    let registry = registry();
    lock::claim_ring();
    shared.lock.claim();
    unsafe { (*registry.ring.get()).push(Arc::clone(shared)) };
    lock::release_ring();
    shared.lock.release();
}

/// Withdraw an arena from the ring. Ring lock before arena lock, so a
/// concurrent `arena_access` holding the ring lock cannot deadlock
/// against us.
pub(crate) fn denounce(shared: &Arc<ArenaShared>) {
    let registry = registry();
    lock::claim_ring();
    shared.lock.claim();
    unsafe {
        let ring = &mut *registry.ring.get();
        let at = ring
            .iter()
            .position(|a| Arc::ptr_eq(a, shared))
            .expect("arena is not announced");
        ring.remove(at);
    }
    lock::release_ring();
    shared.lock.release();
}

fn ring_snapshot() -> Vec<Arc<ArenaShared>> {
    unsafe { (*registry().ring.get()).clone() }
}

/// Claim every lock in the process: the global lock, the ring lock,
/// then every arena. Part of the fork protocol; `release_all` must
/// unwind it exactly.
pub fn claim_all() {
    lock::claim_global_recursive();
    lock::claim_ring();
    for shared in ring_snapshot() {
        let guard = shared.enter();
        std::mem::forget(guard);
    }
}

/// Release everything `claim_all` took.
pub fn release_all() {
    for shared in ring_snapshot() {
        let state = unsafe { &mut *shared.state.get() };
        state.shield_leave();
        shared.lock.release();
    }
    lock::release_ring();
    lock::release_global_recursive();
}

/// Reset every lock in place. A forked child inherits all locks in an
/// undefined state; after this the arenas are usable again.
pub fn reinitialize_all() {
    for shared in ring_snapshot() {
        let state = unsafe { &mut *shared.state.get() };
        state.shield_leave();
        shared.lock.reinit();
    }
    lock::reinit_process_locks();
}

/// Dispatch an access fault. Walks the arena ring under the ring lock;
/// on a hit the ring lock is dropped before the fault is handled.
/// Returns false when no arena owns the address, so the platform layer
/// can fall through to the next handler.
pub fn arena_access(addr: Addr, mode: AccessSet) -> bool {
    assert!(!mode.is_empty());
    if REGISTRY.get().is_none() {
        return false;
    }

    lock::claim_ring();
    let ring = ring_snapshot();

    for shared in ring {
        let mut state = shared.enter();

        if let Some(seg) = state.seg_of_addr(addr) {
            lock::release_ring();
            // A fault on another thread (or a nested handler on this
            // one) may have cleared the protection already; what is
            // left of the mode is ours to resolve.
            let pending = mode & state.segs.get(seg.0).pm;
            if !pending.is_empty() {
                state.seg_access(seg, addr, pending);
            }
            return true;
        }

        if let Some(root) = state.root_of_addr(addr) {
            lock::release_ring();
            let pending = mode & state.root_pm(root);
            if !pending.is_empty() {
                state.root_access(root, pending);
            }
            return true;
        }

        // Neither a segment nor a root: the owner may have freed it
        // concurrently. Try the next arena.
    }

    lock::release_ring();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::config::ArenaConfig;

    #[test]
    fn access_outside_any_arena_is_not_ours() {
        let probe = 0usize;
        assert!(!arena_access(&probe as *const usize as Addr, AccessSet::WRITE));
    }

    #[test]
    fn serials_are_unique() {
        let a = Arena::create(ArenaConfig::with_size(1 << 20)).unwrap();
        let b = Arena::create(ArenaConfig::with_size(1 << 20)).unwrap();
        assert_ne!(a.shared.serial, b.shared.serial);
        a.destroy();
        b.destroy();
    }
}
