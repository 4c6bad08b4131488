//! Access-fault dispatch: the registry must find the owning arena for
//! a protected address, resolve the fault exactly once under
//! concurrency, and disown addresses it does not manage.

use quarry::{arena_access, AccessSet, Arena, ArenaConfig, Rank, RankSet, RefSet, SegPref};
use std::thread;

#[test]
fn faults_dispatch_across_arenas_without_double_handling() {
    let arena_a = Arena::create(ArenaConfig::with_size(4 * 1024 * 1024)).unwrap();
    let arena_b = Arena::create(ArenaConfig::with_size(4 * 1024 * 1024)).unwrap();

    let pool = arena_a.pool_create_manual(16).unwrap();
    let seg = arena_a.seg_alloc(&SegPref::default(), 4096, pool).unwrap();

    // Rank with an empty summary puts the write barrier up.
    arena_a.seg_set_rank_set(seg, RankSet::single(Rank::Exact));
    assert!(arena_a.seg_pm(seg).contains(AccessSet::WRITE));

    let alpha = arena_a.seg_base(seg);

    // Two threads fault on the same address. Whoever resolves second
    // must see the protection already cleared and no-op, yet both
    // report the fault as handled.
    let handles: Vec<_> = (0..2)
        .map(|_| thread::spawn(move || arena_access(alpha, AccessSet::WRITE)))
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }

    // The fault was resolved once: one write-barrier hit, summary
    // opened up, protection gone.
    assert_eq!(arena_a.metrics().write_barrier_hits, 1);
    assert!(arena_a.seg_summary(seg).is_univ());
    assert!(!arena_a.seg_sm(seg).contains(AccessSet::WRITE));
    assert!(!arena_a.seg_pm(seg).contains(AccessSet::WRITE));
    arena_a.check();
    arena_b.check();

    // An address nobody owns is not ours to handle.
    let outside = 0usize;
    assert!(!arena_access(&outside as *const usize as usize, AccessSet::READ));

    arena_a.seg_set_rank_and_summary(seg, RankSet::EMPTY, RefSet::EMPTY);
    arena_a.seg_free(seg);
    arena_a.pool_destroy(pool);

    // After destruction the address is no longer reachable through
    // dispatch.
    arena_a.destroy();
    assert!(!arena_access(alpha, AccessSet::WRITE));
    arena_b.destroy();
}
