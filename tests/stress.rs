//! Manual allocation stress: allocate a set of objects through an
//! allocation point, then repeatedly shuffle, free half and reallocate,
//! checking the pool's books after every step. Manual allocation must
//! never cause a collection.

use quarry::{Arena, ArenaConfig, BufId, PoolId, Rank, Res};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TEST_SET_SIZE: usize = 200;
const TEST_LOOPS: usize = 10;
const ALIGN: usize = 16;

fn make(arena: &Arena, ap: BufId, size: usize) -> Res<usize> {
    loop {
        let addr = arena.reserve(ap, size)?;
        if arena.commit(ap, addr, size) {
            return Ok(addr);
        }
    }
}

fn check_allocated_size(arena: &Arena, pool: PoolId, ap: BufId, allocated: usize) {
    let total = arena.pool_total_size(pool);
    let free = arena.pool_free_size(pool);
    let ap_free = arena.buffer_free_size(ap);
    assert_eq!(total - free, allocated + ap_free);
}

// Sizes both large and small, aligned; smaller as the index grows so
// reallocation fits the holes freeing left behind.
fn random_size_aligned(rng: &mut StdRng, i: usize) -> usize {
    let max_size: usize = 160 * 1024;
    let cap = (max_size >> (i / 10)).max(2);
    let size = rng.gen_range(1..=cap);
    (size + ALIGN - 1) & !(ALIGN - 1)
}

#[test]
fn manual_allocator_stress() {
    let mut cfg = ArenaConfig::with_size(100 * 1024 * 1024);
    cfg.commit_limit = 50 * 1024 * 1024;
    let arena = Arena::create(cfg).unwrap();
    let pool = arena.pool_create_manual(ALIGN).unwrap();
    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut ps = [0usize; TEST_SET_SIZE];
    let mut ss = [0usize; TEST_SET_SIZE];
    let mut allocated = 0usize;

    for i in 0..TEST_SET_SIZE {
        ss[i] = random_size_aligned(&mut rng, i);
        ps[i] = make(&arena, ap, ss[i]).unwrap();
        allocated += ss[i];
        // Write something, so the memory is really there.
        unsafe { *(ps[i] as *mut usize) = 1 };
        check_allocated_size(&arena, pool, ap, allocated);
    }

    // Introspection agrees about every object.
    for p in ps {
        assert!(arena.has_addr(p));
        assert_eq!(arena.pool_of_addr(p), Some(pool));
    }

    for _ in 0..TEST_LOOPS {
        // Shuffle all the objects.
        for i in 0..TEST_SET_SIZE {
            let j = i + rng.gen_range(0..TEST_SET_SIZE - i);
            ps.swap(i, j);
            ss.swap(i, j);
        }
        // Free the upper half; reallocation wants the smaller sizes.
        for i in TEST_SET_SIZE / 2..TEST_SET_SIZE {
            arena.pool_free(pool, ps[i], ss[i]);
            assert!(ss[i] <= allocated);
            allocated -= ss[i];
            check_allocated_size(&arena, pool, ap, allocated);
        }
        // Allocate some new objects.
        for i in TEST_SET_SIZE / 2..TEST_SET_SIZE {
            ss[i] = random_size_aligned(&mut rng, i);
            ps[i] = make(&arena, ap, ss[i]).unwrap();
            allocated += ss[i];
            check_allocated_size(&arena, pool, ap, allocated);
        }
    }

    // Manual allocation must not have caused any collections.
    assert_eq!(arena.collections(), 0);
    arena.check();

    arena.buffer_destroy(ap);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn commit_limit_surfaces_as_an_error() {
    let mut cfg = ArenaConfig::with_size(1024 * 1024);
    cfg.commit_limit = 64 * 1024;
    let arena = Arena::create(cfg).unwrap();
    let pool = arena.pool_create_manual(ALIGN).unwrap();

    // Fill up to the limit, then one more must fail cleanly.
    let a = arena.pool_alloc(pool, 32 * 1024).unwrap();
    let b = arena.pool_alloc(pool, 32 * 1024).unwrap();
    let res = arena.pool_alloc(pool, 32 * 1024);
    assert_eq!(res, Err(quarry::ResErr::CommitLimit));

    // The failure unwound cleanly; the books still balance.
    arena.check();
    arena.pool_free(pool, a, 32 * 1024);
    arena.pool_free(pool, b, 32 * 1024);
    arena.pool_destroy(pool);
    arena.destroy();
}
