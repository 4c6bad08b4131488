//! The poll/step driver and arena-global controls: demand-driven
//! collection, idle-time collection, clamping, emergency mode, message
//! delivery and the describe dump.

use quarry::{Arena, ArenaConfig, BufId, MessageType, Rank, Res, TraceStartWhy};

fn make(arena: &Arena, ap: BufId, size: usize) -> Res<usize> {
    loop {
        let addr = arena.reserve(ap, size)?;
        if arena.commit(ap, addr, size) {
            return Ok(addr);
        }
    }
}

#[test]
fn polling_collects_once_the_nursery_overflows() {
    let mut cfg = ArenaConfig::with_size(8 * 1024 * 1024);
    cfg.gen0_capacity = 64 * 1024;
    cfg.poll_every = 16 * 1024;
    let arena = Arena::create(cfg).unwrap();
    arena.message_enable(MessageType::GcStart, true);
    arena.message_enable(MessageType::Gc, true);

    let pool = arena.pool_create_auto(Rank::Exact).unwrap();
    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();

    for _ in 0..256 {
        make(&arena, ap, 1024).unwrap();
    }

    assert!(arena.collections() >= 1);
    assert!(arena.metrics().traced_work > 0.0);
    assert!(arena.message_poll());
    assert!(arena.message_get(MessageType::GcStart).is_some());
    assert!(arena.message_get(MessageType::Gc).is_some());
    arena.check();

    arena.buffer_destroy(ap);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn clamping_inhibits_collection_until_released() {
    let mut cfg = ArenaConfig::with_size(8 * 1024 * 1024);
    cfg.gen0_capacity = 32 * 1024;
    cfg.poll_every = 8 * 1024;
    let arena = Arena::create(cfg).unwrap();
    let pool = arena.pool_create_auto(Rank::Exact).unwrap();
    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();

    arena.clamp();
    for _ in 0..128 {
        make(&arena, ap, 1024).unwrap();
    }
    assert_eq!(arena.collections(), 0);

    arena.release();
    arena.poll();
    assert!(arena.collections() >= 1);
    arena.check();

    arena.buffer_destroy(ap);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn idle_stepping_collects_the_world_when_worthwhile() {
    let mut cfg = ArenaConfig::with_size(8 * 1024 * 1024);
    cfg.world_collect_min_ms = 0;
    let arena = Arena::create(cfg).unwrap();
    let pool = arena.pool_create_auto(Rank::Exact).unwrap();
    let _obj = arena.pool_alloc(pool, 64 * 1024).unwrap();

    let mut worked = false;
    for _ in 0..64 {
        if arena.step(0.001, 100.0) {
            worked = true;
        }
        if arena.busy_traces().is_empty() && arena.collections() >= 1 {
            break;
        }
    }
    assert!(worked);
    assert!(arena.collections() >= 1);
    assert!(arena.busy_traces().is_empty());
    arena.check();

    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn idle_stepping_with_nothing_collectable_does_nothing() {
    let mut cfg = ArenaConfig::with_size(2 * 1024 * 1024);
    cfg.world_collect_min_ms = 0;
    let arena = Arena::create(cfg).unwrap();
    let pool = arena.pool_create_manual(16).unwrap();
    let _obj = arena.pool_alloc(pool, 4096).unwrap();

    assert!(!arena.step(0.001, 10.0));
    assert_eq!(arena.collections(), 0);

    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn emergency_mode_ends_with_the_last_trace() {
    let arena = Arena::create(ArenaConfig::with_size(2 * 1024 * 1024)).unwrap();

    let ti = arena.begin_trace(TraceStartWhy::Client).unwrap();
    arena.set_emergency(true);
    assert!(arena.emergency());
    arena.check();

    arena.end_trace(ti);
    assert!(!arena.emergency());
    arena.check();

    arena.destroy();
}

#[test]
fn accounting_is_monotone_and_covers_allocation() {
    let arena = Arena::create(ArenaConfig::with_size(4 * 1024 * 1024)).unwrap();
    let pool = arena.pool_create_manual(16).unwrap();
    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();

    let before = arena.metrics();
    for _ in 0..32 {
        make(&arena, ap, 512).unwrap();
    }
    let after = arena.metrics();

    assert!(after.fill_mutator_size >= before.fill_mutator_size);
    assert!(after.empty_mutator_size >= before.empty_mutator_size);
    assert!(after.alloc_mutator_size >= before.alloc_mutator_size + 32.0 * 512.0);
    assert!(after.fill_mutator_size - after.empty_mutator_size >= after.alloc_mutator_size);

    arena.buffer_destroy(ap);
    arena.pool_destroy(pool);
    arena.destroy();
}

#[test]
fn describe_dumps_the_whole_structure() {
    let arena = Arena::create(ArenaConfig::with_size(2 * 1024 * 1024)).unwrap();
    let pool = arena.pool_create_manual(16).unwrap();
    let _obj = arena.pool_alloc(pool, 128).unwrap();
    let ap = arena.buffer_create(pool, Rank::Exact).unwrap();
    let carved = make(&arena, ap, 64).unwrap();

    let stack_slot = 0usize;
    let base = &stack_slot as *const usize as usize;
    let root = arena.root_create(base, base + 8, Rank::Ambig).unwrap();
    let thread = arena.thread_register();
    let format = arena.format_create(8).unwrap();

    let mut out = String::new();
    arena.describe(&mut out, 0).unwrap();
    assert!(out.starts_with("Arena"));
    assert!(out.contains("Shield"));
    assert!(out.contains("Pool"));
    assert!(out.contains("Chain"));
    assert!(out.contains("Segment"));
    assert!(out.contains("Buffer"));
    assert!(out.contains("Roots"));
    assert!(out.contains("threadSerial 1"));

    arena.pool_free(pool, carved, 64);
    arena.buffer_destroy(ap);
    arena.format_destroy(format);
    arena.thread_deregister(thread);
    arena.root_destroy(root);
    arena.pool_destroy(pool);
    arena.destroy();
}
