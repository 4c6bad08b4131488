//! Colour state and barrier maintenance: grey ring membership, read
//! shield transitions around the flip, the write-barrier summary rule
//! on poked references, and the single-reference scan on barriered
//! reads.

use quarry::{
    AccessSet, Arena, ArenaConfig, Rank, RankSet, RefSet, SegId, SegPref, TraceSet, TraceStartWhy,
};

fn arena() -> Arena {
    Arena::create(ArenaConfig::with_size(8 * 1024 * 1024)).unwrap()
}

fn exact_seg(arena: &Arena, pool: quarry::PoolId, grains: usize) -> SegId {
    let size = grains * 4096;
    let seg = arena.seg_alloc(&SegPref::default(), size, pool).unwrap();
    arena.seg_set_rank_set(seg, RankSet::single(Rank::Exact));
    seg
}

#[test]
fn grey_ring_membership_follows_the_colour() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let seg = exact_seg(&arena, pool, 1);

    arena.seg_set_grey(seg, TraceSet::EMPTY);
    assert!(!arena.grey_ring(Rank::Exact).contains(&seg));

    let t0 = arena.begin_trace(TraceStartWhy::Client).unwrap();

    // Grey for an unflipped trace: on the ring, but no read shield.
    arena.seg_set_grey(seg, TraceSet::single(t0));
    assert!(arena.grey_ring(Rank::Exact).contains(&seg));
    assert!(!arena.seg_sm(seg).contains(AccessSet::READ));

    // After the flip the read barrier applies.
    arena.flip_trace(t0);
    assert!(arena.seg_sm(seg).contains(AccessSet::READ));
    assert!(arena.seg_pm(seg).contains(AccessSet::READ));

    // Blackening unlinks and lowers the shield.
    arena.seg_set_grey(seg, TraceSet::EMPTY);
    assert!(!arena.grey_ring(Rank::Exact).contains(&seg));
    assert!(!arena.seg_sm(seg).contains(AccessSet::READ));
    arena.check();

    arena.end_trace(t0);
    arena.seg_free(seg);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn setting_grey_twice_is_idempotent_in_state_and_ring() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let seg = exact_seg(&arena, pool, 1);
    let t0 = arena.begin_trace(TraceStartWhy::Client).unwrap();

    let x = TraceSet::single(t0);
    arena.seg_set_grey(seg, x);
    arena.seg_set_grey(seg, x);
    assert_eq!(arena.seg_grey(seg), x);
    assert_eq!(
        arena
            .grey_ring(Rank::Exact)
            .iter()
            .filter(|s| **s == seg)
            .count(),
        1
    );
    arena.check();

    arena.seg_set_grey(seg, TraceSet::EMPTY);
    arena.end_trace(t0);
    arena.seg_free(seg);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn poked_references_grow_the_summary() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let seg = exact_seg(&arena, pool, 1);
    let target = arena.seg_alloc(&SegPref::high(), 4096, pool).unwrap();

    // A strict summary that cannot contain the referent's zone.
    arena.seg_set_summary(seg, RefSet::EMPTY);
    assert!(arena.seg_sm(seg).contains(AccessSet::WRITE));

    let p = arena.seg_base(seg);
    let r = arena.seg_base(target);
    arena.write(p, r);

    assert!(arena.seg_summary(seg).has_zone(arena.zone_of(r)));
    assert_eq!(arena.read(p), r);
    arena.check();

    arena.seg_free(target);
    arena.seg_set_summary(seg, RefSet::EMPTY);
    arena.seg_free(seg);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn barriered_reads_scan_white_referents() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let holder = exact_seg(&arena, pool, 1);
    let target = exact_seg(&arena, pool, 1);

    let slot = arena.seg_base(holder);
    let referent = arena.seg_base(target);
    arena.write(slot, referent);

    let t0 = arena.begin_trace(TraceStartWhy::Client).unwrap();
    arena.seg_set_white(target, TraceSet::single(t0));
    arena.seg_set_grey(holder, TraceSet::single(t0));
    arena.flip_trace(t0);

    // Reading through the barrier must not leak a white reference:
    // the single-ref scan preserves the referent first.
    let seen = arena.read(slot);
    assert_eq!(seen, referent);
    assert!(arena.seg_white(target).is_empty());
    // Preserved means grey now, so its own references get scanned.
    assert!(arena.seg_grey(target).has(t0));
    arena.check();

    arena.end_trace(t0);
    arena.seg_free(holder);
    arena.seg_free(target);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn ambiguous_references_nail_instead_of_unwhitening() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let holder = arena.seg_alloc(&SegPref::default(), 4096, pool).unwrap();
    arena.seg_set_rank_set(holder, RankSet::single(Rank::Ambig));
    let target = exact_seg(&arena, pool, 1);

    let slot = arena.seg_base(holder);
    let referent = arena.seg_base(target);
    arena.write(slot, referent);

    let t0 = arena.begin_trace(TraceStartWhy::Client).unwrap();
    arena.seg_set_white(target, TraceSet::single(t0));
    arena.seg_set_grey(holder, TraceSet::single(t0));
    arena.flip_trace(t0);

    // An ambiguous reference pins the target: it stays white but is
    // nailed for the trace.
    let seen = arena.read(slot);
    assert_eq!(seen, referent);
    assert!(arena.seg_white(target).has(t0));
    assert!(arena.seg_nailed(target).has(t0));
    arena.check();

    // Retiring the trace drops the nailing with the whiteness.
    arena.end_trace(t0);
    assert!(arena.seg_white(target).is_empty());
    assert!(arena.seg_nailed(target).is_empty());

    arena.seg_free(holder);
    arena.seg_free(target);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn segment_iteration_walks_in_address_order() {
    let arena = arena();
    let pool = arena.pool_create_manual(16).unwrap();
    let low = arena.seg_alloc(&SegPref::default(), 2 * 4096, pool).unwrap();
    let high = arena.seg_alloc(&SegPref::high(), 4096, pool).unwrap();

    assert_eq!(arena.seg_first(), Some(low));
    assert_eq!(arena.seg_next(arena.seg_base(low)), Some(high));
    assert_eq!(arena.seg_next(arena.seg_base(high)), None);

    arena.seg_free(low);
    arena.seg_free(high);
    arena.pool_destroy(pool);
    arena.destroy();
}
