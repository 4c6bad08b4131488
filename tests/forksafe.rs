//! Fork protocol: claiming every lock in the process, releasing them
//! exactly, and reinitializing them in place as a forked child would.
//! Both paths must leave every arena fully usable.

use quarry::{claim_all, reinitialize_all, release_all, Arena, ArenaConfig};

fn exercise(arena: &Arena) {
    let pool = arena.pool_create_manual(16).unwrap();
    let obj = arena.pool_alloc(pool, 128).unwrap();
    assert!(arena.has_addr(obj));
    arena.pool_free(pool, obj, 128);
    arena.check();
    arena.pool_destroy(pool);
}

#[test]
fn claim_release_and_reinitialize_leave_arenas_usable() {
    let arena_a = Arena::create(ArenaConfig::with_size(2 * 1024 * 1024)).unwrap();
    let arena_b = Arena::create(ArenaConfig::with_size(2 * 1024 * 1024)).unwrap();

    // Prepare/parent: claim everything, release everything.
    claim_all();
    assert!(arena_a.busy());
    assert!(arena_b.busy());
    release_all();
    assert!(!arena_a.busy());
    assert!(!arena_b.busy());
    exercise(&arena_a);
    exercise(&arena_b);

    // Child: the claimed locks are inherited in an undefined state and
    // reset in place.
    claim_all();
    reinitialize_all();
    assert!(!arena_a.busy());
    assert!(!arena_b.busy());
    exercise(&arena_a);
    exercise(&arena_b);

    arena_a.destroy();
    arena_b.destroy();
}
