use criterion::{criterion_group, criterion_main, Criterion};

use quarry::{Arena, ArenaConfig, Rank};

fn alloc_and_free(c: &mut Criterion) {
    let arena = Arena::create(ArenaConfig::with_size(64 * 1024 * 1024)).unwrap();
    let pool = arena.pool_create_manual(16).unwrap();

    c.bench_function("pool alloc/free 256B", |b| {
        b.iter(|| {
            let obj = arena.pool_alloc(pool, 256).unwrap();
            arena.pool_free(pool, obj, 256);
        });
    });

    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();
    c.bench_function("reserve/commit/free 64B", |b| {
        b.iter(|| {
            let obj = arena.reserve(ap, 64).unwrap();
            arena.commit(ap, obj, 64);
            arena.pool_free(pool, obj, 64);
        });
    });

    arena.buffer_destroy(ap);
    arena.pool_destroy(pool);
    arena.destroy();
}

fn lookup(c: &mut Criterion) {
    let arena = Arena::create(ArenaConfig::with_size(64 * 1024 * 1024)).unwrap();
    let pool = arena.pool_create_manual(16).unwrap();
    let obj = arena.pool_alloc(pool, 4096).unwrap();

    c.bench_function("seg_of_addr", |b| {
        b.iter(|| arena.seg_of_addr(obj));
    });

    arena.pool_free(pool, obj, 4096);
    arena.pool_destroy(pool);
    arena.destroy();
}

criterion_group!(benches, alloc_and_free, lookup);
criterion_main!(benches);
