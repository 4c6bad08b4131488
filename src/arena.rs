//! The arena: the control plane for one memory management instance.
//! All mutable state hangs off `ArenaState`, which is a monitor: it is
//! only ever touched with the arena lock held, bracketed by a shield
//! section. The public `Arena` type wraps the shared state and exposes
//! the operation surface; every public entry claims the lock (after a
//! stack probe) and releases it on the way out.

use crate::buffer::{BufId, Buffer};
use crate::chain::{Chain, ChainId, GenParam, History};
use crate::config::ArenaConfig;
use crate::describe::wline;
use crate::global;
use crate::lock::RecLock;
use crate::message::{Message, MessageQueue, MessageType};
use crate::metrics::ArenaMetrics;
use crate::pool::{Pool, PoolId};
use crate::res::{Res, ResErr};
use crate::root::{Format, FormatId, Root, RootId, ThreadReg};
use crate::seg::{Seg, SegClass, SegId};
use crate::set::{AccessSet, Rank, RankSet, RefSet, TraceId, TraceSet, RANK_COUNT, TRACE_MAX};
use crate::shield::Shield;
use crate::slab::Slab;
use crate::trace::{TraceSlot, TraceStartWhy};
use crate::tract::{Addr, SegPref, TractTable};
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

// Bound on the remembered-summary diagnostic ring.
const REMEMBERED_SUMMARY_BLOCK: usize = 64;

pub(crate) struct ArenaState {
    pub(crate) cfg: ArenaConfig,
    pub(crate) serial: u64,

    pub(crate) tracts: TractTable,
    pub(crate) segs: Slab<Seg>,
    pub(crate) pools: Slab<Pool>,
    pub(crate) buffers: Slab<Buffer>,
    pub(crate) roots: Slab<Root>,
    pub(crate) formats: Slab<Format>,
    pub(crate) chains: Slab<Chain>,

    pub(crate) pool_ring: Vec<PoolId>,
    pub(crate) root_ring: Vec<RootId>,
    pub(crate) format_ring: Vec<FormatId>,
    pub(crate) chain_ring: Vec<ChainId>,
    pub(crate) threads: Vec<ThreadReg>,
    pub(crate) dead_threads: Vec<ThreadReg>,

    pub(crate) pool_serial: u64,
    pub(crate) root_serial: u64,
    pub(crate) format_serial: u64,
    pub(crate) thread_serial: u64,
    pub(crate) chain_serial: u64,
    pub(crate) buffer_serial: u64,

    pub(crate) grey_rings: [Vec<SegId>; RANK_COUNT],
    pub(crate) traces: [TraceSlot; TRACE_MAX],
    pub(crate) busy_traces: TraceSet,
    pub(crate) flipped_traces: TraceSet,
    pub(crate) emergency: bool,

    pub(crate) shield: Shield,
    pub(crate) messages: MessageQueue,
    pub(crate) history: History,

    pub(crate) is_final_pool: bool,
    pub(crate) final_pool: Option<PoolId>,
    pub(crate) default_chain: Option<ChainId>,

    // Poll state.
    pub(crate) poll_threshold: f64,
    pub(crate) inside_poll: bool,
    pub(crate) clamped: bool,
    pub(crate) last_world_collect: Instant,
    pub(crate) collections: usize,

    // Mutator accounting; all monotone non-decreasing.
    pub(crate) fill_mutator_size: f64,
    pub(crate) empty_mutator_size: f64,
    pub(crate) alloc_mutator_size: f64,
    pub(crate) fill_internal_size: f64,
    pub(crate) empty_internal_size: f64,

    pub(crate) traced_work: f64,
    pub(crate) traced_time: f64,

    pub(crate) write_barrier_hits: u64,
    pub(crate) access_faults: u64,

    // Summaries displaced by write faults, kept for diagnosis.
    pub(crate) remembered: Vec<(Addr, RefSet)>,
}

impl ArenaState {
    fn init(cfg: ArenaConfig, serial: u64) -> Res<ArenaState> {
        let tracts = TractTable::new(&cfg)?;
        Ok(ArenaState {
            cfg,
            serial,
            tracts,
            segs: Slab::new(),
            pools: Slab::new(),
            buffers: Slab::new(),
            roots: Slab::new(),
            formats: Slab::new(),
            chains: Slab::new(),
            pool_ring: Vec::new(),
            root_ring: Vec::new(),
            format_ring: Vec::new(),
            chain_ring: Vec::new(),
            threads: Vec::new(),
            dead_threads: Vec::new(),
            pool_serial: 0,
            root_serial: 0,
            format_serial: 0,
            thread_serial: 0,
            chain_serial: 0,
            buffer_serial: 0,
            grey_rings: std::array::from_fn(|_| Vec::new()),
            traces: std::array::from_fn(|_| TraceSlot::Invalid),
            busy_traces: TraceSet::EMPTY,
            flipped_traces: TraceSet::EMPTY,
            emergency: false,
            shield: Shield::new(),
            messages: MessageQueue::new(),
            history: History::new(),
            is_final_pool: false,
            final_pool: None,
            default_chain: None,
            poll_threshold: 0.0,
            inside_poll: false,
            clamped: false,
            last_world_collect: Instant::now(),
            collections: 0,
            fill_mutator_size: 0.0,
            empty_mutator_size: 0.0,
            alloc_mutator_size: 0.0,
            fill_internal_size: 0.0,
            empty_internal_size: 0.0,
            traced_work: 0.0,
            traced_time: 0.0,
            write_barrier_hits: 0,
            access_faults: 0,
            remembered: Vec::new(),
        })
    }

    /// The final initializations: message staging and the default
    /// chain. Split from `init` because the arena must be announced
    /// only after these complete.
    fn complete_create(&mut self) {
        self.message_stage_all();
        let gen0 = self.cfg.gen0_capacity;
        let gen1 = self.cfg.gen1_capacity;
        let chain = self.chain_create(vec![
            GenParam {
                capacity: gen0,
                mortality: 0.85,
            },
            GenParam {
                capacity: gen1,
                mortality: 0.45,
            },
        ]);
        self.default_chain = Some(chain);
    }

    // Accounting. fill - empty never drops below alloc; the asserts
    // keep the books honest at every update.

    pub(crate) fn account_fill_mutator(&mut self, size: f64) {
        assert!(size >= 0.0);
        self.fill_mutator_size += size;
    }

    pub(crate) fn account_empty_mutator(&mut self, size: f64) {
        assert!(size >= 0.0);
        self.empty_mutator_size += size;
        assert!(self.fill_mutator_size - self.empty_mutator_size >= self.alloc_mutator_size);
    }

    pub(crate) fn account_alloc_mutator(&mut self, size: f64) {
        assert!(size >= 0.0);
        self.alloc_mutator_size += size;
        assert!(self.fill_mutator_size - self.empty_mutator_size >= self.alloc_mutator_size);
    }

    pub(crate) fn account_fill_internal(&mut self, size: f64) {
        assert!(size >= 0.0);
        self.fill_internal_size += size;
    }

    pub(crate) fn account_empty_internal(&mut self, size: f64) {
        assert!(size >= 0.0);
        self.empty_internal_size += size;
    }

    pub(crate) fn accumulate_time(&mut self, start: Instant, end: Instant) {
        let elapsed = end.duration_since(start);
        self.traced_time += elapsed.as_secs_f64();
        self.history.record(self.traced_work, elapsed);
    }

    /// Trigger periodic background work on mutator time. Does nothing
    /// while clamped, re-entered, or below the poll threshold.
    pub(crate) fn poll(&mut self) {
        if self.clamped || self.inside_poll {
            return;
        }
        if !self.policy_should_poll() {
            return;
        }
        self.inside_poll = true;
        let start = Instant::now();
        log::trace!(target: "quarry::event", "ArenaPoll arena={} begin", self.serial);

        let mut work_was_done = false;
        let mut world_collected = false;
        loop {
            let (more_work, world, work) = self.trace_poll(!world_collected);
            if world {
                world_collected = true;
            }
            if work > 0 || more_work {
                work_was_done = true;
            }
            if !self.policy_poll_again(start, more_work, work) {
                break;
            }
        }

        // Don't count time spent looking for work when there was none.
        if work_was_done {
            self.accumulate_time(start, Instant::now());
        }
        self.policy_rearm_poll();
        log::trace!(target: "quarry::event",
            "ArenaPoll arena={} end worked={work_was_done}", self.serial);
        self.inside_poll = false;
    }

    /// Use idle time for collection work. Returns whether any work was
    /// done. At least one step runs even if the interval has already
    /// elapsed.
    pub(crate) fn step(&mut self, interval: f64, multiplier: f64) -> bool {
        assert!(interval >= 0.0);
        assert!(multiplier >= 0.0);

        let start = Instant::now();
        let interval_end = Duration::from_secs_f64(interval);
        let available = Duration::from_secs_f64(interval * multiplier);
        let mut work_was_done = false;

        loop {
            let now = Instant::now();
            let ti = match self.busy_traces.iter().next() {
                Some(ti) => ti,
                None => {
                    let left = available.saturating_sub(now.duration_since(start));
                    if self.policy_should_collect_world(left, now) {
                        match self.trace_start_collect_all(TraceStartWhy::Opportunism) {
                            Ok(ti) => {
                                self.last_world_collect = now;
                                ti
                            }
                            Err(_) => break,
                        }
                    } else {
                        match self.policy_start_trace(false) {
                            Some(why) => match self.trace_start_collect_all(why) {
                                Ok(ti) => ti,
                                Err(_) => break,
                            },
                            None => break,
                        }
                    }
                }
            };

            self.trace_advance(ti);
            if self.traces[ti.index()].busy().state == crate::trace::TraceState::Finished {
                self.trace_destroy_finished(ti);
            }
            work_was_done = true;
            if start.elapsed() >= interval_end {
                break;
            }
        }

        if work_was_done {
            self.accumulate_time(start, Instant::now());
        }
        work_was_done
    }

    /// Register an object for finalization. The guardian pool is
    /// created lazily on first use.
    pub(crate) fn finalize(&mut self, obj: Addr) -> Res<()> {
        let pool = self
            .pool_of_addr(obj)
            .expect("finalizing an address outside any pool");
        assert!(
            self.pool_has_gc(pool),
            "finalizing an object in an uncollected pool"
        );

        if !self.is_final_pool {
            let final_pool = self.pool_create_guardian()?;
            self.final_pool = Some(final_pool);
            self.is_final_pool = true;
        }
        let final_pool = self.final_pool.expect("final pool flag without a pool");
        self.guardian_register(final_pool, obj)
    }

    /// Remove one finalization registration. Fails when nothing was
    /// ever registered or this object was not.
    pub(crate) fn definalize(&mut self, obj: Addr) -> Res<()> {
        assert!(self.tracts.has_addr(obj));
        if !self.is_final_pool {
            return Err(ResErr::Fail);
        }
        let final_pool = self.final_pool.expect("final pool flag without a pool");
        self.guardian_deregister(final_pool, obj)
    }

    /// Read one reference slot inside a segment, through the barrier.
    pub(crate) fn peek_seg(&mut self, seg: SegId, p: Addr) -> usize {
        assert!(self.seg_base(seg) <= p && p < self.seg_limit(seg));

        // A white reference may only be read once every trace it is
        // white for has flipped; before that a single-ref scan is
        // undefined.
        assert!(self.segs.get(seg.0).white.sub(self.flipped_traces));

        // Scan conservatively at the access rank so a white reference
        // cannot leak to the mutator unmarked.
        let flipped = self.flipped_traces;
        if !self.segs.get(seg.0).grey.inter(flipped).is_empty() {
            let rank = self.trace_rank_for_access(seg);
            self.trace_scan_single_ref(flipped, rank, seg, p);
        }

        self.shield_expose(seg);
        let value = unsafe { *(p as *const usize) };
        self.shield_cover(seg);
        value
    }

    /// Write one reference slot inside a segment, through the barrier.
    /// The summary grows by the referent's zone so it stays an
    /// overapproximation.
    pub(crate) fn poke_seg(&mut self, seg: SegId, p: Addr, value: usize) {
        assert!(self.seg_base(seg) <= p && p < self.seg_limit(seg));

        self.shield_expose(seg);
        unsafe { *(p as *mut usize) = value };
        let summary = self.seg_summary(seg);
        self.seg_set_summary(seg, summary.add_zone(self.tracts.zone_of(value)));
        self.shield_cover(seg);
    }

    /// Handle an access fault on a segment. `mode` has already been
    /// masked by the enforced protection, so everything left must be
    /// resolved here.
    pub(crate) fn seg_access(&mut self, seg: SegId, addr: Addr, mode: AccessSet) {
        assert!(!mode.is_empty());
        assert!(self.segs.get(seg.0).pm.contains(mode));
        self.access_faults += 1;
        log::debug!(target: "quarry::event",
            "ArenaAccess arena={} seg={} addr={addr:#x} mode={mode:?}", self.serial, seg.0);

        if mode.contains(AccessSet::READ) {
            // The mutator wants to read something still grey for a
            // flipped trace: scan the whole segment now.
            let pending = self.segs.get(seg.0).grey.inter(self.flipped_traces);
            for ti in pending.iter() {
                let work = self.trace_scan_seg(ti, seg);
                if let TraceSlot::Busy(trace) = &mut self.traces[ti.index()] {
                    trace.scanned += work;
                }
            }
        }

        if mode.contains(AccessSet::WRITE) {
            // The mutator may write any reference anywhere, so the
            // summary promise has to be given up. Keep the displaced
            // summary for diagnosis.
            let old = self.seg_summary(seg);
            if self.remembered.len() == REMEMBERED_SUMMARY_BLOCK {
                self.remembered.remove(0);
            }
            self.remembered.push((self.seg_base(seg), old));
            self.seg_set_summary(seg, RefSet::UNIV);
            self.write_barrier_hits += 1;
        }
    }

    pub(crate) fn set_emergency(&mut self, emergency: bool) {
        if emergency {
            assert!(
                !self.busy_traces.is_empty(),
                "emergency without a busy trace"
            );
        }
        log::debug!(target: "quarry::event",
            "ArenaSetEmergency arena={} emergency={emergency}", self.serial);
        self.emergency = emergency;
    }

    pub(crate) fn metrics(&self) -> ArenaMetrics {
        ArenaMetrics {
            reserved: self.tracts.reserved(),
            committed: self.tracts.committed(),
            commit_limit: self.tracts.commit_limit(),
            collections: self.collections,
            busy_traces: self.busy_traces.len(),
            flipped_traces: self.flipped_traces.len(),
            fill_mutator_size: self.fill_mutator_size,
            empty_mutator_size: self.empty_mutator_size,
            alloc_mutator_size: self.alloc_mutator_size,
            fill_internal_size: self.fill_internal_size,
            empty_internal_size: self.empty_internal_size,
            traced_work: self.traced_work,
            traced_time: self.traced_time,
            write_barrier_hits: self.write_barrier_hits,
            access_faults: self.access_faults,
            dropped_messages: self.messages.dropped,
            epoch: self.history.epoch,
        }
    }

    /// The invariant battery. Valid at any quiescent point; panics on
    /// the first violation.
    pub(crate) fn check(&self) {
        assert!(self.flipped_traces.sub(self.busy_traces));
        assert!(self.fill_mutator_size >= 0.0);
        assert!(self.empty_mutator_size >= 0.0);
        assert!(self.alloc_mutator_size >= 0.0);
        assert!(self.fill_mutator_size - self.empty_mutator_size >= self.alloc_mutator_size);
        assert!(self.fill_internal_size >= 0.0);
        assert!(self.empty_internal_size >= 0.0);
        assert!(self.traced_work >= 0.0);
        assert!(self.traced_time >= 0.0);

        for index in 0..TRACE_MAX {
            let busy = matches!(self.traces[index], TraceSlot::Busy(_));
            assert_eq!(busy, self.busy_traces.has(TraceId(index as u8)));
        }

        assert!(!self.emergency || !self.busy_traces.is_empty());
        assert_eq!(self.is_final_pool, self.final_pool.is_some());
        assert!(self.remembered.len() <= REMEMBERED_SUMMARY_BLOCK);

        for pool in &self.pool_ring {
            self.pool_check(*pool);
        }
        for (id, _) in self.segs.iter() {
            self.seg_check(SegId(id));
        }
        for (id, _) in self.buffers.iter() {
            self.buffer_check(BufId(id));
        }

        // Grey ring members must be ranked for the ring they are on and
        // actually grey.
        for rank in Rank::ALL {
            for seg in &self.grey_rings[rank.index()] {
                let seg = self.segs.get(seg.0);
                assert!(seg.rank_set.has(rank));
                assert!(!seg.grey.is_empty());
            }
        }
    }

    pub(crate) fn describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        wline!(w, depth, "Arena {}", self.serial)?;
        wline!(w, depth + 2, "reserved {} kB", self.tracts.reserved() / 1024)?;
        wline!(w, depth + 2, "committed {} kB", self.tracts.committed() / 1024)?;
        wline!(
            w,
            depth + 2,
            "pollThreshold {} kB",
            (self.poll_threshold / 1024.0) as u64
        )?;
        wline!(
            w,
            depth + 2,
            "{} poll",
            if self.inside_poll { "inside" } else { "outside" }
        )?;
        wline!(
            w,
            depth + 2,
            "{}",
            if self.clamped { "clamped" } else { "released" }
        )?;
        wline!(
            w,
            depth + 2,
            "fillMutatorSize {} kB",
            (self.fill_mutator_size / 1024.0) as u64
        )?;
        wline!(
            w,
            depth + 2,
            "emptyMutatorSize {} kB",
            (self.empty_mutator_size / 1024.0) as u64
        )?;
        wline!(
            w,
            depth + 2,
            "allocMutatorSize {} kB",
            (self.alloc_mutator_size / 1024.0) as u64
        )?;
        wline!(w, depth + 2, "poolSerial {}", self.pool_serial)?;
        wline!(w, depth + 2, "rootSerial {}", self.root_serial)?;
        wline!(w, depth + 2, "formatSerial {}", self.format_serial)?;
        wline!(w, depth + 2, "threadSerial {}", self.thread_serial)?;
        wline!(w, depth + 2, "busyTraces    {:?}", self.busy_traces)?;
        wline!(w, depth + 2, "flippedTraces {:?}", self.flipped_traces)?;

        self.history.describe(w, depth + 2)?;
        self.shield_describe(w, depth + 2)?;
        self.roots_describe(w, depth + 2)?;
        self.message_describe(w, depth + 2)?;
        for pool in &self.pool_ring {
            self.pool_describe(*pool, w, depth + 2)?;
        }
        for (id, _) in self.buffers.iter() {
            self.buffer_describe(BufId(id), w, depth + 2)?;
        }
        for chain in &self.chain_ring {
            self.chain_describe(*chain, w, depth + 2)?;
        }
        for ti in self.busy_traces.iter() {
            self.trace_describe(ti, w, depth + 2)?;
        }
        Ok(())
    }
}

pub(crate) struct ArenaShared {
    pub(crate) serial: u64,
    pub(crate) lock: RecLock,
    pub(crate) state: UnsafeCell<ArenaState>,
}

// The state is only reached through the lock; see ArenaGuard.
unsafe impl Send for ArenaShared {}
unsafe impl Sync for ArenaShared {}

impl ArenaShared {
    /// Enter the state where the arena may be inspected and mutated.
    pub(crate) fn enter(&self) -> ArenaGuard<'_> {
        // The probe must happen before the lock is claimed: it can run
        // arbitrary code via a fault handler, and that code may enter
        // the arena.
        stack_probe();
        self.lock.claim();
        let guard = ArenaGuard {
            shared: self,
            recursive: false,
        };
        unsafe { (*self.state.get()).shield_enter() };
        guard
    }

    /// Enter for the few paths that are re-entrant with respect to some
    /// part of the arena. The shield section is not re-entered.
    pub(crate) fn enter_recursive(&self) -> ArenaGuard<'_> {
        stack_probe();
        self.lock.claim_recursive();
        ArenaGuard {
            shared: self,
            recursive: true,
        }
    }
}

pub(crate) struct ArenaGuard<'a> {
    shared: &'a ArenaShared,
    recursive: bool,
}

impl Deref for ArenaGuard<'_> {
    type Target = ArenaState;

    fn deref(&self) -> &ArenaState {
        unsafe { &*self.shared.state.get() }
    }
}

impl DerefMut for ArenaGuard<'_> {
    fn deref_mut(&mut self) -> &mut ArenaState {
        unsafe { &mut *self.shared.state.get() }
    }
}

impl Drop for ArenaGuard<'_> {
    fn drop(&mut self) {
        if self.recursive {
            self.shared.lock.release_recursive();
        } else {
            // Leaving reconciles protection with the shield so the
            // mutator never runs against a stale pm.
            unsafe { (*self.shared.state.get()).shield_leave() };
            self.shared.lock.release();
        }
    }
}

/// Touch the stack ahead of the current frame so guard pages fault here
/// rather than under the arena lock.
#[inline(never)]
fn stack_probe() {
    const PROBE_WORDS: usize = 64;
    let mut probe = [0usize; PROBE_WORDS];
    let mut index = 0;
    while index < PROBE_WORDS {
        probe[index] = index;
        index += 8;
    }
    std::hint::black_box(&probe);
}

/// An arena instance. Creation announces it to the process-wide
/// registry; destruction (or drop) parks it, withdraws it and checks
/// that the client tore everything down.
pub struct Arena {
    pub(crate) shared: Arc<ArenaShared>,
    destroyed: bool,
}

impl Arena {
    pub fn create(cfg: ArenaConfig) -> Res<Arena> {
        global::ensure_setup();
        let serial = global::assign_serial();
        let state = ArenaState::init(cfg, serial)?;
        let shared = Arc::new(ArenaShared {
            serial,
            lock: RecLock::new(),
            state: UnsafeCell::new(state),
        });
        shared.enter().complete_create();
        global::announce(&shared);
        Ok(Arena {
            shared,
            destroyed: false,
        })
    }

    /// Destroy the arena. Client pools, buffers, roots and formats must
    /// already be gone.
    pub fn destroy(mut self) {
        self.teardown();
        self.destroyed = true;
    }

    fn teardown(&mut self) {
        // Park first: no trace may be using the default chain when it
        // goes away.
        self.shared.enter().trace_park();

        // After this no other thread can reach the arena through the
        // registry.
        global::denounce(&self.shared);

        let mut state = self.shared.enter();

        let chain = state
            .default_chain
            .take()
            .expect("arena has no default chain");
        state.chain_destroy(chain);

        if state.messages.dropped > 0 {
            log::debug!(target: "quarry::event",
                "MessagesDropped count={}", state.messages.dropped);
        }
        // Empty the queue before destroying the finalization pool:
        // queued messages may refer to its memory.
        if state.message_poll() {
            log::debug!(target: "quarry::event", "MessagesExist");
        }
        state.message_empty();

        if state.is_final_pool {
            let pool = state.final_pool.take().expect("final pool flag without a pool");
            state.is_final_pool = false;
            state.pool_destroy(pool);
        }

        if state.write_barrier_hits > 0 {
            log::debug!(target: "quarry::event",
                "ArenaWriteFaults count={}", state.write_barrier_hits);
        }

        state.shield_finish();
        state.dead_threads.clear();

        // The client must have destroyed everything it created.
        assert!(state.pools.is_empty(), "client pools survive the arena");
        assert!(state.root_ring.is_empty(), "client roots survive the arena");
        assert!(state.format_ring.is_empty(), "client formats survive the arena");
        assert!(state.chain_ring.is_empty(), "client chains survive the arena");
        assert!(state.threads.is_empty(), "registered threads survive the arena");
        assert!(state.buffers.is_empty(), "client buffers survive the arena");
        for ring in &state.grey_rings {
            assert!(ring.is_empty());
        }
    }

    // -- introspection ---------------------------------------------------

    pub fn has_addr(&self, addr: Addr) -> bool {
        let state = self.shared.enter_recursive();
        state.tracts.of_addr(addr).is_some()
    }

    pub fn pool_of_addr(&self, addr: Addr) -> Option<PoolId> {
        self.shared.enter().pool_of_addr(addr)
    }

    pub fn collections(&self) -> usize {
        self.shared.enter().collections
    }

    pub fn committed(&self) -> usize {
        self.shared.enter().tracts.committed()
    }

    pub fn reserved(&self) -> usize {
        self.shared.enter().tracts.reserved()
    }

    /// Is the arena lock held right now?
    pub fn busy(&self) -> bool {
        self.shared.lock.is_held()
    }

    pub fn metrics(&self) -> ArenaMetrics {
        self.shared.enter().metrics()
    }

    pub fn check(&self) {
        self.shared.enter().check();
    }

    pub fn describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        self.shared.enter().describe(w, depth)
    }

    // -- collection control ----------------------------------------------

    pub fn poll(&self) {
        self.shared.enter().poll();
    }

    pub fn step(&self, interval: f64, multiplier: f64) -> bool {
        self.shared.enter().step(interval, multiplier)
    }

    /// Inhibit collection until released.
    pub fn clamp(&self) {
        self.shared.enter().clamped = true;
    }

    pub fn release(&self) {
        self.shared.enter().clamped = false;
    }

    /// Run every in-flight collection to completion.
    pub fn park(&self) {
        self.shared.enter().trace_park();
    }

    pub fn set_emergency(&self, emergency: bool) {
        self.shared.enter().set_emergency(emergency);
    }

    pub fn emergency(&self) -> bool {
        self.shared.enter().emergency
    }

    pub fn begin_trace(&self, why: TraceStartWhy) -> Res<TraceId> {
        self.shared.enter().trace_create(why)
    }

    pub fn condemn_world(&self, ti: TraceId) {
        self.shared.enter().trace_condemn_world(ti);
    }

    /// Advance a trace up to and including its flip.
    pub fn flip_trace(&self, ti: TraceId) {
        let mut state = self.shared.enter();
        while !state.flipped_traces.has(ti) {
            state.trace_advance(ti);
        }
    }

    /// Run one trace to completion and retire it.
    pub fn end_trace(&self, ti: TraceId) {
        let mut state = self.shared.enter();
        while state.traces[ti.index()].busy().state != crate::trace::TraceState::Finished {
            state.trace_advance(ti);
        }
        state.trace_destroy_finished(ti);
    }

    pub fn busy_traces(&self) -> TraceSet {
        self.shared.enter().busy_traces
    }

    pub fn flipped_traces(&self) -> TraceSet {
        self.shared.enter().flipped_traces
    }

    // -- finalization ----------------------------------------------------

    pub fn finalize(&self, obj: Addr) -> Res<()> {
        self.shared.enter().finalize(obj)
    }

    pub fn definalize(&self, obj: Addr) -> Res<()> {
        self.shared.enter().definalize(obj)
    }

    pub fn is_finalization_configured(&self) -> bool {
        self.shared.enter().is_final_pool
    }

    // -- barriered reads and writes --------------------------------------

    /// Read a single reference, through the barrier when the address is
    /// arena-owned.
    ///
    /// # Safety
    ///
    /// `p` must be readable as a word when it lies outside the arena;
    /// inside the arena it only needs to be in bounds.
    pub unsafe fn peek(&self, p: Addr) -> usize {
        let mut state = self.shared.enter();
        match state.seg_of_addr(p) {
            Some(seg) => state.peek_seg(seg, p),
            None => *(p as *const usize),
        }
    }

    /// Write a single reference, through the barrier when the address
    /// is arena-owned.
    ///
    /// # Safety
    ///
    /// `p` must be writable as a word when it lies outside the arena;
    /// inside the arena it only needs to be in bounds.
    pub unsafe fn poke(&self, p: Addr, value: usize) {
        let mut state = self.shared.enter();
        match state.seg_of_addr(p) {
            Some(seg) => state.poke_seg(seg, p, value),
            None => *(p as *mut usize) = value,
        }
    }

    /// Like `peek`, but the address must be arena-owned.
    pub fn read(&self, p: Addr) -> usize {
        let mut state = self.shared.enter();
        let seg = state.seg_of_addr(p).expect("read of an unowned address");
        state.peek_seg(seg, p)
    }

    /// Like `poke`, but the address must be arena-owned.
    pub fn write(&self, p: Addr, value: usize) {
        let mut state = self.shared.enter();
        let seg = state.seg_of_addr(p).expect("write of an unowned address");
        state.poke_seg(seg, p, value);
    }

    // -- pools and buffers -----------------------------------------------

    pub fn pool_create_manual(&self, alignment: usize) -> Res<PoolId> {
        self.shared.enter().pool_create_manual(alignment)
    }

    pub fn pool_create_auto(&self, rank: Rank) -> Res<PoolId> {
        self.shared.enter().pool_create_auto(rank)
    }

    pub fn pool_destroy(&self, pool: PoolId) {
        self.shared.enter().pool_destroy(pool);
    }

    pub fn pool_alloc(&self, pool: PoolId, size: usize) -> Res<Addr> {
        self.shared.enter().pool_alloc(pool, size)
    }

    pub fn pool_free(&self, pool: PoolId, addr: Addr, size: usize) {
        self.shared.enter().pool_free(pool, addr, size);
    }

    pub fn pool_total_size(&self, pool: PoolId) -> usize {
        self.shared.enter().pool_total_size(pool)
    }

    pub fn pool_free_size(&self, pool: PoolId) -> usize {
        self.shared.enter().pool_free_size(pool)
    }

    pub fn buffer_create(&self, pool: PoolId, rank: Rank) -> Res<BufId> {
        self.shared.enter().buffer_create(pool, rank)
    }

    pub fn buffer_destroy(&self, buffer: BufId) {
        self.shared.enter().buffer_destroy(buffer);
    }

    /// Reserve room for an object at the buffer's allocation point.
    /// Polls on the refill slow path, like any allocation entry.
    pub fn reserve(&self, buffer: BufId, size: usize) -> Res<Addr> {
        let mut state = self.shared.enter();
        let addr = state.buffer_reserve(buffer, size)?;
        state.poll();
        Ok(addr)
    }

    pub fn commit(&self, buffer: BufId, addr: Addr, size: usize) -> bool {
        self.shared.enter().buffer_commit(buffer, addr, size)
    }

    pub fn buffer_free_size(&self, buffer: BufId) -> usize {
        self.shared.enter().buffer_free(buffer)
    }

    // -- segments --------------------------------------------------------

    pub fn seg_alloc(&self, pref: &SegPref, size: usize, pool: PoolId) -> Res<SegId> {
        self.shared.enter().seg_alloc(pref, size, pool)
    }

    pub fn seg_alloc_of_class(
        &self,
        class: SegClass,
        pref: &SegPref,
        size: usize,
        pool: PoolId,
    ) -> Res<SegId> {
        self.shared
            .enter()
            .seg_alloc_of_class(class, pref, size, pool)
    }

    pub fn seg_free(&self, seg: SegId) {
        self.shared.enter().seg_free(seg);
    }

    pub fn seg_of_addr(&self, addr: Addr) -> Option<SegId> {
        self.shared.enter().seg_of_addr(addr)
    }

    pub fn seg_first(&self) -> Option<SegId> {
        self.shared.enter().seg_first()
    }

    pub fn seg_next(&self, addr: Addr) -> Option<SegId> {
        self.shared.enter().seg_next(addr)
    }

    pub fn seg_base(&self, seg: SegId) -> Addr {
        self.shared.enter().seg_base(seg)
    }

    pub fn seg_limit(&self, seg: SegId) -> Addr {
        self.shared.enter().seg_limit(seg)
    }

    pub fn seg_size(&self, seg: SegId) -> usize {
        self.shared.enter().seg_size(seg)
    }

    pub fn seg_pool(&self, seg: SegId) -> PoolId {
        self.shared.enter().seg_pool(seg)
    }

    pub fn seg_set_grey(&self, seg: SegId, grey: TraceSet) {
        self.shared.enter().seg_set_grey(seg, grey);
    }

    pub fn seg_set_white(&self, seg: SegId, white: TraceSet) {
        self.shared.enter().seg_set_white(seg, white);
    }

    pub fn seg_set_rank_set(&self, seg: SegId, rank_set: RankSet) {
        self.shared.enter().seg_set_rank_set(seg, rank_set);
    }

    pub fn seg_set_summary(&self, seg: SegId, summary: RefSet) {
        self.shared.enter().seg_set_summary(seg, summary);
    }

    pub fn seg_set_rank_and_summary(&self, seg: SegId, rank_set: RankSet, summary: RefSet) {
        self.shared
            .enter()
            .seg_set_rank_and_summary(seg, rank_set, summary);
    }

    pub fn seg_set_p(&self, seg: SegId, p: usize) {
        self.shared.enter().seg_set_p(seg, p);
    }

    pub fn seg_grey(&self, seg: SegId) -> TraceSet {
        self.shared.enter().segs.get(seg.0).grey
    }

    pub fn seg_white(&self, seg: SegId) -> TraceSet {
        self.shared.enter().segs.get(seg.0).white
    }

    pub fn seg_nailed(&self, seg: SegId) -> TraceSet {
        self.shared.enter().segs.get(seg.0).nailed
    }

    pub fn seg_rank_set(&self, seg: SegId) -> RankSet {
        self.shared.enter().segs.get(seg.0).rank_set
    }

    pub fn seg_summary(&self, seg: SegId) -> RefSet {
        self.shared.enter().seg_summary(seg)
    }

    pub fn seg_sm(&self, seg: SegId) -> AccessSet {
        self.shared.enter().segs.get(seg.0).sm
    }

    pub fn seg_pm(&self, seg: SegId) -> AccessSet {
        self.shared.enter().segs.get(seg.0).pm
    }

    pub fn seg_p(&self, seg: SegId) -> usize {
        self.shared.enter().seg_p(seg)
    }

    /// Snapshot of one per-rank grey ring.
    pub fn grey_ring(&self, rank: Rank) -> Vec<SegId> {
        self.shared.enter().grey_rings[rank.index()].clone()
    }

    pub fn zone_of(&self, addr: Addr) -> u8 {
        self.shared.enter().tracts.zone_of(addr)
    }

    // -- client registries -----------------------------------------------

    pub fn root_create(&self, base: Addr, limit: Addr, rank: Rank) -> Res<RootId> {
        self.shared.enter().root_create(base, limit, rank)
    }

    pub fn root_destroy(&self, root: RootId) {
        self.shared.enter().root_destroy(root);
    }

    pub fn thread_register(&self) -> u64 {
        self.shared.enter().thread_register()
    }

    pub fn thread_deregister(&self, serial: u64) {
        self.shared.enter().thread_deregister(serial);
    }

    pub fn format_create(&self, alignment: usize) -> Res<FormatId> {
        self.shared.enter().format_create(alignment)
    }

    pub fn format_destroy(&self, format: FormatId) {
        self.shared.enter().format_destroy(format);
    }

    pub fn chain_create(&self, gens: Vec<GenParam>) -> ChainId {
        self.shared.enter().chain_create(gens)
    }

    pub fn chain_destroy(&self, chain: ChainId) {
        self.shared.enter().chain_destroy(chain);
    }

    // -- messages --------------------------------------------------------

    pub fn message_enable(&self, mtype: MessageType, enabled: bool) {
        self.shared.enter().message_enable(mtype, enabled);
    }

    pub fn message_poll(&self) -> bool {
        self.shared.enter().message_poll()
    }

    pub fn message_get(&self, mtype: MessageType) -> Option<Message> {
        self.shared.enter().message_get(mtype)
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if !self.destroyed {
            self.teardown();
        }
    }
}
