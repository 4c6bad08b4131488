//! Traces: incremental collection cycles living in the arena's fixed
//! trace table. A slot is either invalid or holds a busy trace. Colour
//! transitions go through the segment operations so barrier maintenance
//! stays centralized; this module decides which segment to scan next
//! and drives the lifecycle
//! Init -> Unflipped -> Flipped -> Reclaim -> Finished.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::{Res, ResErr};
use crate::seg::SegId;
use crate::set::{AccessSet, Rank, RefSet, TraceId, TraceSet, TRACE_MAX};
use crate::tract::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Init,
    Unflipped,
    Flipped,
    Reclaim,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStartWhy {
    /// The client asked for a collection.
    Client,
    /// Idle time looked like a good moment to collect the world.
    Opportunism,
    /// New allocation outgrew a generation.
    Chain,
}

pub(crate) struct Trace {
    pub(crate) ti: TraceId,
    pub(crate) state: TraceState,
    pub(crate) why: TraceStartWhy,
    pub(crate) world: bool,
    pub(crate) condemned: usize,
    pub(crate) scanned: usize,
}

#[allow(clippy::large_enum_variant)]
pub(crate) enum TraceSlot {
    Invalid,
    Busy(Trace),
}

impl TraceSlot {
    pub(crate) fn busy(&self) -> &Trace {
        match self {
            TraceSlot::Busy(trace) => trace,
            TraceSlot::Invalid => panic!("trace slot is invalid"),
        }
    }

    fn busy_mut(&mut self) -> &mut Trace {
        match self {
            TraceSlot::Busy(trace) => trace,
            TraceSlot::Invalid => panic!("trace slot is invalid"),
        }
    }
}

impl ArenaState {
    /// Claim a free trace slot. Fails with `Limit` when all slots are
    /// busy.
    pub(crate) fn trace_create(&mut self, why: TraceStartWhy) -> Res<TraceId> {
        let index = (0..TRACE_MAX)
            .find(|i| matches!(self.traces[*i], TraceSlot::Invalid))
            .ok_or(ResErr::Limit)?;
        let ti = TraceId(index as u8);

        self.traces[index] = TraceSlot::Busy(Trace {
            ti,
            state: TraceState::Init,
            why,
            world: false,
            condemned: 0,
            scanned: 0,
        });
        self.busy_traces = self.busy_traces.add(ti);
        self.collections += 1;
        self.message_post_trace_start(ti);
        log::debug!(target: "quarry::event",
            "TraceCreate arena={} trace={} why={why:?}", self.serial, ti.0);
        Ok(ti)
    }

    /// Condemn every collected segment for this trace. Buffered
    /// segments are spared; the mutator is allocating into them.
    pub(crate) fn trace_condemn_world(&mut self, ti: TraceId) {
        let mut condemned = 0;
        for pool in self.pool_ring.clone() {
            if !self.pool_has_gc(pool) {
                continue;
            }
            for seg in self.pools.get(pool.0).seg_ring.clone() {
                if self.seg_buffer(seg).is_some() {
                    continue;
                }
                let white = self.segs.get(seg.0).white;
                self.seg_set_white(seg, white.add(ti));
                condemned += self.seg_size(seg);
            }
        }
        let trace = self.traces[ti.index()].busy_mut();
        trace.condemned = condemned;
        trace.world = true;
        self.chain_reset_fill();
    }

    /// Greyen every segment that may hold references to the condemned
    /// set, then let the mutator run grey (unflipped). Condemned
    /// segments stay black; they turn grey only if a fix preserves
    /// them.
    fn trace_begin(&mut self, ti: TraceId) {
        for seg in self.segs.ids() {
            let seg = SegId(seg);
            let greyen = {
                let s = self.segs.get(seg.0);
                s.is_gc() && !s.rank_set.is_empty() && !s.white.has(ti)
            };
            if greyen {
                let grey = self.segs.get(seg.0).grey;
                self.seg_set_grey(seg, grey.add(ti));
            }
        }
        self.traces[ti.index()].busy_mut().state = TraceState::Unflipped;
    }

    /// Flip: from here the mutator sees the post-collection heap and
    /// the read barrier applies to everything still grey.
    fn trace_flip(&mut self, ti: TraceId) {
        self.flipped_traces = self.flipped_traces.add(ti);

        // Segments already grey for this trace were greyed before the
        // flip, so their read shields were not raised then; raise them
        // now.
        for rank in Rank::ALL {
            for seg in self.grey_rings[rank.index()].clone() {
                let raise = {
                    let s = self.segs.get(seg.0);
                    s.grey.has(ti) && !s.sm.contains(AccessSet::READ)
                };
                if raise {
                    self.shield_raise(seg, AccessSet::READ);
                }
            }
        }
        self.traces[ti.index()].busy_mut().state = TraceState::Flipped;
    }

    /// Pick the next grey segment for this trace, in rank order.
    fn trace_find_grey(&self, ti: TraceId) -> Option<SegId> {
        for rank in Rank::ALL {
            for seg in &self.grey_rings[rank.index()] {
                if self.segs.get(seg.0).grey.has(ti) {
                    return Some(*seg);
                }
            }
        }
        None
    }

    /// One unit of trace progress. Returns the work done in bytes.
    pub(crate) fn trace_advance(&mut self, ti: TraceId) -> usize {
        let state = self.traces[ti.index()].busy().state;
        match state {
            TraceState::Init => {
                self.trace_begin(ti);
                0
            }
            TraceState::Unflipped => {
                self.trace_flip(ti);
                0
            }
            TraceState::Flipped => match self.trace_find_grey(ti) {
                Some(seg) => {
                    let work = self.trace_scan_seg(ti, seg);
                    self.traces[ti.index()].busy_mut().scanned += work;
                    work
                }
                None => {
                    self.traces[ti.index()].busy_mut().state = TraceState::Reclaim;
                    0
                }
            },
            TraceState::Reclaim => {
                self.trace_reclaim(ti);
                let trace = self.traces[ti.index()].busy_mut();
                trace.state = TraceState::Finished;
                let condemned = trace.condemned;
                self.message_post_trace_end(ti, condemned);
                0
            }
            TraceState::Finished => 0,
        }
    }

    /// Scan one grey segment: fix every word in it, record the summary
    /// the scan saw, and blacken the segment for this trace.
    pub(crate) fn trace_scan_seg(&mut self, ti: TraceId, seg: SegId) -> usize {
        let base = self.seg_base(seg);
        let limit = self.seg_limit(seg);
        let rank = self
            .segs
            .get(seg.0)
            .rank_set
            .the_rank()
            .expect("scanning a rank-less segment");
        let ts = TraceSet::single(ti);

        self.shield_expose(seg);
        let mut summary = RefSet::EMPTY;
        let word = std::mem::size_of::<usize>();
        let mut addr = base;
        while addr < limit {
            let value = unsafe { *(addr as *const usize) };
            if value != 0 {
                summary = summary.add_zone(self.tracts.zone_of(value));
                self.trace_fix(ts, rank, value);
            }
            addr += word;
        }
        self.shield_cover(seg);

        self.seg_set_summary(seg, summary);
        let grey = self.segs.get(seg.0).grey;
        self.seg_set_grey(seg, grey.del(ti));
        limit - base
    }

    /// Fix one reference: if it hits a segment white for any trace in
    /// `ts`, preserve the target. Ambiguous references nail; stronger
    /// ranks unwhiten and re-greyen the target so its children get
    /// scanned.
    fn trace_fix(&mut self, ts: TraceSet, rank: Rank, value: Addr) {
        let target = match self.seg_of_addr(value) {
            Some(target) => target,
            None => return,
        };
        let hit = self.segs.get(target.0).white.inter(ts);
        if hit.is_empty() {
            return;
        }
        if rank == Rank::Ambig {
            let seg = self.segs.get_mut(target.0);
            seg.nailed = seg.nailed.union(hit);
            return;
        }
        let white = self.segs.get(target.0).white;
        self.seg_set_white(target, white.diff(hit));
        if !self.segs.get(target.0).rank_set.is_empty() {
            let grey = self.segs.get(target.0).grey;
            self.seg_set_grey(target, grey.union(hit));
        }
    }

    /// Scan a single reference slot on behalf of a barrier read.
    pub(crate) fn trace_scan_single_ref(
        &mut self,
        ts: TraceSet,
        rank: Rank,
        seg: SegId,
        addr: Addr,
    ) {
        self.shield_expose(seg);
        let value = unsafe { *(addr as *const usize) };
        self.shield_cover(seg);
        if value != 0 {
            self.trace_fix(ts, rank, value);
            let summary = self.seg_summary(seg);
            self.seg_set_summary(seg, summary.add_zone(self.tracts.zone_of(value)));
        }
    }

    /// The rank to scan at when the mutator faults on a segment: the
    /// segment's own rank.
    pub(crate) fn trace_rank_for_access(&self, seg: SegId) -> Rank {
        self.segs
            .get(seg.0)
            .rank_set
            .the_rank()
            .expect("access rank of a rank-less segment")
    }

    /// Drop this trace's whiteness (and nailing) everywhere. Reclaiming
    /// storage is the owning pool's business; colour-wise the condemned
    /// set survives the trace.
    fn trace_reclaim(&mut self, ti: TraceId) {
        for seg in self.segs.ids() {
            let seg = SegId(seg);
            if !self.segs.get(seg.0).is_gc() {
                continue;
            }
            let white = self.segs.get(seg.0).white;
            if white.has(ti) {
                self.seg_set_white(seg, white.del(ti));
            }
            let nailed = self.segs.get(seg.0).nailed;
            if nailed.has(ti) {
                self.segs.get_mut(seg.0).nailed = nailed.del(ti);
            }
        }
    }

    /// Retire a finished trace and release its slot.
    pub(crate) fn trace_destroy_finished(&mut self, ti: TraceId) {
        let (state, scanned) = {
            let trace = self.traces[ti.index()].busy();
            (trace.state, trace.scanned)
        };
        assert_eq!(state, TraceState::Finished);

        self.traced_work += scanned as f64;
        self.busy_traces = self.busy_traces.del(ti);
        self.flipped_traces = self.flipped_traces.del(ti);
        self.traces[ti.index()] = TraceSlot::Invalid;

        // There can only be an emergency while a trace is busy.
        if self.busy_traces.is_empty() {
            self.emergency = false;
        }
    }

    /// Create, condemn and begin a whole-world collection.
    pub(crate) fn trace_start_collect_all(&mut self, why: TraceStartWhy) -> Res<TraceId> {
        let ti = self.trace_create(why)?;
        self.trace_condemn_world(ti);
        self.trace_begin(ti);
        Ok(ti)
    }

    /// One quantum of polling work on behalf of the mutator. Returns
    /// (more work remains, a world collection completed, work done).
    pub(crate) fn trace_poll(&mut self, allow_world: bool) -> (bool, bool, usize) {
        if self.busy_traces.is_empty() {
            match self.policy_start_trace(allow_world) {
                Some(why) => {
                    if self.trace_start_collect_all(why).is_err() {
                        return (false, false, 0);
                    }
                }
                None => return (false, false, 0),
            }
        }

        let ti = self
            .busy_traces
            .iter()
            .next()
            .expect("busy trace set is empty");
        let quantum = self.cfg.trace_quantum;
        let mut work = 0;
        loop {
            work += self.trace_advance(ti);
            if self.traces[ti.index()].busy().state == TraceState::Finished {
                let world = self.traces[ti.index()].busy().world;
                self.trace_destroy_finished(ti);
                return (!self.busy_traces.is_empty(), world, work);
            }
            if work >= quantum {
                return (true, false, work);
            }
        }
    }

    /// Run every busy trace to completion. The arena is "parked" after
    /// this: no collection is in progress.
    pub(crate) fn trace_park(&mut self) {
        while let Some(ti) = self.busy_traces.iter().next() {
            while self.traces[ti.index()].busy().state != TraceState::Finished {
                self.trace_advance(ti);
            }
            self.trace_destroy_finished(ti);
        }
    }

    pub(crate) fn trace_describe(
        &self,
        ti: TraceId,
        w: &mut dyn std::fmt::Write,
        depth: usize,
    ) -> Res<()> {
        let trace = self.traces[ti.index()].busy();
        wline!(w, depth, "Trace {}", ti.0)?;
        wline!(w, depth + 2, "state {:?}", trace.state)?;
        wline!(w, depth + 2, "why {:?}", trace.why)?;
        wline!(w, depth + 2, "condemned {} kB", trace.condemned / 1024)?;
        wline!(w, depth + 2, "scanned {} kB", trace.scanned / 1024)
    }
}
