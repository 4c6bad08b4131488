//! Segments: contiguous aligned tract runs owned by one pool, carrying
//! the colour, rank, summary and shielding state that tracing needs.
//!
//! There are two segment classes. A plain segment is as small as
//! efficiency permits and supports no collection features: the colour
//! and summary operations on it are "not reached" and panic. The GC
//! segment supports the full feature set and is the default class.
//! Dispatch is by a tagged body on the shared header, so the colour and
//! rank branches stay in straight-line code.

use crate::arena::ArenaState;
use crate::buffer::BufId;
use crate::describe::wline;
use crate::pool::PoolId;
use crate::res::Res;
use crate::set::{AccessSet, Rank, RankSet, RefSet, TraceSet};
use crate::tract::{Addr, SegPref};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegId(pub(crate) u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegClass {
    Plain,
    Gc,
}

pub(crate) struct Seg {
    pub(crate) first_tract: usize,
    pub(crate) limit: Addr,
    pub(crate) pool: PoolId,
    pub(crate) rank_set: RankSet,
    pub(crate) white: TraceSet,
    pub(crate) grey: TraceSet,
    pub(crate) nailed: TraceSet,
    pub(crate) pm: AccessSet,
    pub(crate) sm: AccessSet,
    pub(crate) depth: u32,
    pub(crate) body: SegBody,
}

pub(crate) enum SegBody {
    Plain,
    Gc(GcSeg),
}

pub(crate) struct GcSeg {
    pub(crate) summary: RefSet,
    pub(crate) buffer: Option<BufId>,
    pub(crate) p: usize,
}

impl Seg {
    pub(crate) fn is_gc(&self) -> bool {
        matches!(self.body, SegBody::Gc(_))
    }

    pub(crate) fn gc(&self) -> &GcSeg {
        match &self.body {
            SegBody::Gc(gc) => gc,
            SegBody::Plain => panic!("segment has no collection support"),
        }
    }

    pub(crate) fn gc_mut(&mut self) -> &mut GcSeg {
        match &mut self.body {
            SegBody::Gc(gc) => gc,
            SegBody::Plain => panic!("segment has no collection support"),
        }
    }
}

impl ArenaState {
    /// Allocate a segment of the default (GC) class.
    pub(crate) fn seg_alloc(&mut self, pref: &SegPref, size: usize, pool: PoolId) -> Res<SegId> {
        self.seg_alloc_of_class(SegClass::Gc, pref, size, pool)
    }

    /// Allocate a segment of a given class: a tract run from the table
    /// plus a wired-up descriptor. On failure the tract run is returned
    /// so no partial segment is ever observable.
    pub(crate) fn seg_alloc_of_class(
        &mut self,
        class: SegClass,
        pref: &SegPref,
        size: usize,
        pool: PoolId,
    ) -> Res<SegId> {
        assert!(size > 0);
        assert!(size % self.tracts.grain() == 0);
        assert!(self.pools.contains(pool.0));

        let base = match self.tracts.alloc(pref, size, pool) {
            Ok(base) => base,
            Err(err) => {
                log::debug!(target: "quarry::event",
                    "SegAllocFail arena={} size={size} pool={} err={err}", self.serial, pool.0);
                return Err(err);
            }
        };
        let limit = base + size;

        let body = match class {
            SegClass::Plain => SegBody::Plain,
            SegClass::Gc => SegBody::Gc(GcSeg {
                summary: RefSet::EMPTY,
                buffer: None,
                p: 0,
            }),
        };
        let first_tract = self.tracts.of_addr(base).expect("fresh run has no tract");
        let id = SegId(self.segs.insert(Seg {
            first_tract,
            limit,
            pool,
            rank_set: RankSet::EMPTY,
            white: TraceSet::EMPTY,
            grey: TraceSet::EMPTY,
            nailed: TraceSet::EMPTY,
            pm: AccessSet::empty(),
            sm: AccessSet::empty(),
            depth: 0,
            body,
        }));

        // Wire up every tract in the range.
        for index in self.tracts.range(base, limit) {
            let tract = self.tracts.tract_mut(index);
            assert!(tract.seg.is_none(), "tract already carries a segment");
            assert_eq!(tract.pool, Some(pool));
            assert!(tract.white.is_empty());
            tract.seg = Some(id);
        }

        if class == SegClass::Gc {
            let owner = self.pools.get_mut(pool.0);
            owner.seg_ring.push(id);
            owner.total_size += size;
        }
        self.account_fill_internal(std::mem::size_of::<Seg>() as f64);

        log::debug!(target: "quarry::event",
            "SegAlloc arena={} seg={} base={base:#x} size={size} pool={}",
            self.serial, id.0, pool.0);
        Ok(id)
    }

    /// Free a segment: lower any shielding, unwire the tracts and give
    /// the range back to the tract table.
    pub(crate) fn seg_free(&mut self, id: SegId) {
        let (sm, pool, base, limit, is_gc) = {
            let seg = self.segs.get(id.0);
            (seg.sm, seg.pool, self.seg_base(id), seg.limit, seg.is_gc())
        };

        if !sm.is_empty() {
            self.shield_lower(id, sm);
        }

        // Class-specific finishing comes first.
        if is_gc {
            let grey = self.segs.get(id.0).grey;
            if !grey.is_empty() {
                let rank = self
                    .segs
                    .get(id.0)
                    .rank_set
                    .the_rank()
                    .expect("grey segment has no rank");
                self.grey_unlink(id, rank);
                self.segs.get_mut(id.0).grey = TraceSet::EMPTY;
            }
            // Don't leave a dangling buffer allocating into hyperspace.
            assert!(self.segs.get(id.0).gc().buffer.is_none());
            self.segs.get_mut(id.0).gc_mut().summary = RefSet::EMPTY;
            let owner = self.pools.get_mut(pool.0);
            let at = owner
                .seg_ring
                .iter()
                .position(|s| *s == id)
                .expect("segment not on pool ring");
            owner.seg_ring.swap_remove(at);
            owner.total_size -= limit - base;
        }

        self.segs.get_mut(id.0).rank_set = RankSet::EMPTY;
        self.shield_flush();

        for index in self.tracts.range(base, limit) {
            let tract = self.tracts.tract_mut(index);
            tract.white = TraceSet::EMPTY;
            tract.seg = None;
        }

        {
            let seg = self.segs.get(id.0);
            assert_eq!(seg.depth, 0, "freeing an exposed segment");
            assert!(seg.sm.is_empty());
            assert!(seg.pm.is_empty());
        }

        self.segs.remove(id.0);
        self.tracts.free(base, limit - base, pool);
        self.account_empty_internal(std::mem::size_of::<Seg>() as f64);

        log::debug!(target: "quarry::event",
            "SegFree arena={} seg={} base={base:#x}", self.serial, id.0);
    }

    pub(crate) fn seg_base(&self, id: SegId) -> Addr {
        self.tracts.base_of(self.segs.get(id.0).first_tract)
    }

    pub(crate) fn seg_limit(&self, id: SegId) -> Addr {
        self.segs.get(id.0).limit
    }

    pub(crate) fn seg_size(&self, id: SegId) -> usize {
        self.seg_limit(id) - self.seg_base(id)
    }

    pub(crate) fn seg_pool(&self, id: SegId) -> PoolId {
        self.segs.get(id.0).pool
    }

    pub(crate) fn seg_summary(&self, id: SegId) -> RefSet {
        self.segs.get(id.0).gc().summary
    }

    pub(crate) fn seg_buffer(&self, id: SegId) -> Option<BufId> {
        self.segs.get(id.0).gc().buffer
    }

    pub(crate) fn seg_p(&self, id: SegId) -> usize {
        self.segs.get(id.0).gc().p
    }

    pub(crate) fn seg_set_p(&mut self, id: SegId, p: usize) {
        self.segs.get_mut(id.0).gc_mut().p = p;
    }

    /// Change the greyness of a segment, keeping the per-rank grey ring
    /// and the read shield in step.
    pub(crate) fn seg_set_grey(&mut self, id: SegId, grey: TraceSet) {
        let (old_grey, rank_set, is_gc) = {
            let seg = self.segs.get(id.0);
            (seg.grey, seg.rank_set, seg.is_gc())
        };
        assert!(is_gc, "segment has no collection support");
        assert!(!rank_set.is_empty(), "grey segment must have a rank");
        let rank = rank_set.the_rank().expect("rank set must be a singleton");

        self.segs.get_mut(id.0).grey = grey;

        // Grey ring membership tracks the empty/non-empty transition so
        // the tracer can find grey segments quickly.
        if old_grey.is_empty() {
            if !grey.is_empty() {
                self.grey_link(id, rank);
            }
        } else if grey.is_empty() {
            self.grey_unlink(id, rank);
        }

        // The read barrier is up while the segment is grey for some
        // flipped trace, i.e. grey for a trace whose mutator is black.
        let flipped = self.flipped_traces;
        if old_grey.inter(flipped).is_empty() {
            if !grey.inter(flipped).is_empty() {
                self.shield_raise(id, AccessSet::READ);
            }
        } else if grey.inter(flipped).is_empty() {
            self.shield_lower(id, AccessSet::READ);
        }

        log::trace!(target: "quarry::event",
            "SegSetGrey arena={} seg={} grey={grey:?}", self.serial, id.0);
    }

    /// Change the whiteness of a segment. Each tract mirrors the white
    /// set so the fault path can test whiteness without the descriptor.
    pub(crate) fn seg_set_white(&mut self, id: SegId, white: TraceSet) {
        let (base, limit, is_gc) = {
            let seg = self.segs.get(id.0);
            (self.seg_base(id), seg.limit, seg.is_gc())
        };
        assert!(is_gc, "segment has no collection support");

        for index in self.tracts.range(base, limit) {
            let tract = self.tracts.tract_mut(index);
            assert_eq!(tract.seg, Some(id));
            tract.white = white;
        }
        self.segs.get_mut(id.0).white = white;
    }

    /// Set the rank set of a segment. Making the rank set non-empty
    /// means the segment now holds references whose summary (empty) is
    /// a strict subset of the mutator's, so the write barrier goes up;
    /// making it empty takes the barrier down. The caller keeps the
    /// summary empty across both transitions.
    pub(crate) fn seg_set_rank_set(&mut self, id: SegId, rank_set: RankSet) {
        assert!(rank_set.is_empty() || rank_set.is_single());
        let (old, summary, is_gc) = {
            let seg = self.segs.get(id.0);
            (seg.rank_set, seg.gc().summary, seg.is_gc())
        };
        assert!(is_gc, "segment has no collection support");

        self.segs.get_mut(id.0).rank_set = rank_set;

        if old.is_empty() {
            if !rank_set.is_empty() {
                assert!(summary.is_empty());
                self.shield_raise(id, AccessSet::WRITE);
            }
        } else if rank_set.is_empty() {
            assert!(summary.is_empty());
            self.shield_lower(id, AccessSet::WRITE);
        }
    }

    /// Change the summary on a segment. The write barrier is needed
    /// exactly while the summary is a strict subset of the mutator's
    /// (universal) summary, since an unobserved write could otherwise
    /// break the promise the summary makes.
    pub(crate) fn seg_set_summary(&mut self, id: SegId, summary: RefSet) {
        let (rank_set, old) = {
            let seg = self.segs.get(id.0);
            (seg.rank_set, seg.gc().summary)
        };
        assert!(!rank_set.is_empty(), "summary on a rank-less segment");

        self.segs.get_mut(id.0).gc_mut().summary = summary;

        if !summary.is_univ() {
            if old.is_univ() {
                self.shield_raise(id, AccessSet::WRITE);
            }
        } else if !old.is_univ() {
            self.shield_lower(id, AccessSet::WRITE);
        }
    }

    /// Set rank set and summary together with a single shield
    /// adjustment on the overall transition.
    pub(crate) fn seg_set_rank_and_summary(
        &mut self,
        id: SegId,
        rank_set: RankSet,
        summary: RefSet,
    ) {
        assert!(rank_set.is_empty() || rank_set.is_single());
        assert!(!rank_set.is_empty() || summary.is_empty());
        let (old_rank, old_summary, is_gc) = {
            let seg = self.segs.get(id.0);
            (seg.rank_set, seg.gc().summary, seg.is_gc())
        };
        assert!(is_gc, "segment has no collection support");

        let was_shielded = !old_rank.is_empty() && !old_summary.is_univ();
        let will_be_shielded = !rank_set.is_empty() && !summary.is_univ();

        {
            let seg = self.segs.get_mut(id.0);
            seg.rank_set = rank_set;
            seg.gc_mut().summary = summary;
        }

        if will_be_shielded && !was_shielded {
            self.shield_raise(id, AccessSet::WRITE);
        } else if was_shielded && !will_be_shielded {
            self.shield_lower(id, AccessSet::WRITE);
        }
    }

    /// Attach or detach an allocation buffer. A segment carries at most
    /// one, and it must belong to the segment's pool.
    pub(crate) fn seg_set_buffer(&mut self, id: SegId, buffer: Option<BufId>) {
        if let Some(buf) = buffer {
            assert_eq!(self.buffers.get(buf.0).pool, self.segs.get(id.0).pool);
        }
        self.segs.get_mut(id.0).gc_mut().buffer = buffer;
    }

    pub(crate) fn seg_of_addr(&self, addr: Addr) -> Option<SegId> {
        let index = self.tracts.of_addr(addr)?;
        self.tracts.tract(index).seg
    }

    /// First segment in the arena by address order.
    pub(crate) fn seg_first(&self) -> Option<SegId> {
        let mut index = self.tracts.first()?;
        loop {
            if let Some(seg) = self.tracts.tract(index).seg {
                return Some(seg);
            }
            index = self.tracts.next(self.tracts.base_of(index))?;
        }
    }

    /// The segment with the lowest base strictly above `addr`, where
    /// `addr` is (or once was) the base of a segment. Tracts inside a
    /// multi-tract segment are skipped, as are segment-less tracts.
    pub(crate) fn seg_next(&self, addr: Addr) -> Option<SegId> {
        let mut base = addr;
        loop {
            let index = self.tracts.next(base)?;
            let tract_base = self.tracts.base_of(index);
            match self.tracts.tract(index).seg {
                Some(seg) => {
                    if self.segs.get(seg.0).first_tract == index {
                        return Some(seg);
                    }
                    // A middle tract of a large segment: skip to its
                    // last tract.
                    base = self.segs.get(seg.0).limit - self.tracts.grain();
                }
                None => base = tract_base,
            }
        }
    }

    pub(crate) fn grey_link(&mut self, id: SegId, rank: Rank) {
        debug_assert!(!self.grey_rings[rank.index()].contains(&id));
        self.grey_rings[rank.index()].push(id);
    }

    pub(crate) fn grey_unlink(&mut self, id: SegId, rank: Rank) {
        let ring = &mut self.grey_rings[rank.index()];
        let at = ring
            .iter()
            .position(|s| *s == id)
            .expect("segment not on its grey ring");
        ring.swap_remove(at);
    }

    pub(crate) fn seg_describe(
        &self,
        id: SegId,
        w: &mut dyn std::fmt::Write,
        depth: usize,
    ) -> Res<()> {
        let seg = self.segs.get(id.0);
        let pool = self.pools.get(seg.pool.0);

        wline!(w, depth, "Segment {} [{:#x},{:#x}) {{", id.0, self.seg_base(id), seg.limit)?;
        wline!(w, depth + 2, "pool {} (serial {})", seg.pool.0, pool.serial)?;
        wline!(w, depth + 2, "shield depth {}", seg.depth)?;
        wline!(w, depth + 2, "protection mode:{}", access_names(seg.pm))?;
        wline!(w, depth + 2, "shield mode:{}", access_names(seg.sm))?;
        wline!(w, depth + 2, "ranks:{}", rank_names(seg.rank_set))?;
        wline!(w, depth + 2, "white  {:#06b}", bits_of(seg.white))?;
        wline!(w, depth + 2, "grey   {:#06b}", bits_of(seg.grey))?;
        wline!(w, depth + 2, "nailed {:#06b}", bits_of(seg.nailed))?;
        if let SegBody::Gc(gc) = &seg.body {
            wline!(w, depth + 2, "summary {:#018x}", gc.summary.bits())?;
            match gc.buffer {
                Some(buf) => wline!(w, depth + 2, "buffer {}", buf.0)?,
                None => wline!(w, depth + 2, "buffer none")?,
            }
        }
        wline!(w, depth, "}} Segment {}", id.0)
    }

    /// Check the integrity of one segment, including the shield
    /// invariants.
    pub(crate) fn seg_check(&self, id: SegId) {
        let seg = self.segs.get(id.0);
        let base = self.seg_base(id);
        let grain = self.tracts.grain();

        assert!(base % grain == 0);
        assert!(seg.limit % grain == 0);
        assert!(seg.limit > base);

        // Every tract of the segment agrees with the descriptor.
        for index in self.tracts.range(base, seg.limit) {
            let tract = self.tracts.tract(index);
            assert_eq!(tract.seg, Some(id));
            assert_eq!(tract.white, seg.white);
            assert_eq!(tract.pool, Some(seg.pool));
        }

        // Protection never exceeds what the shield asked for, and
        // nothing is left exposed at a quiescent point.
        assert!(seg.sm.contains(seg.pm));
        assert_eq!(seg.depth, 0);

        if seg.rank_set.is_empty() {
            // No references, so no colour and no barriers.
            assert!(seg.grey.is_empty());
            assert!(seg.sm.is_empty());
            assert!(seg.pm.is_empty());
            if seg.is_gc() {
                assert!(seg.gc().summary.is_empty());
            }
        } else {
            assert!(seg.rank_set.is_single());
        }

        if let SegBody::Gc(gc) = &seg.body {
            // Grey ring membership mirrors greyness.
            let linked = seg
                .rank_set
                .the_rank()
                .map(|rank| self.grey_rings[rank.index()].contains(&id))
                .unwrap_or(false);
            assert_eq!(linked, !seg.grey.is_empty());

            // Read barrier up iff grey for a flipped trace; write
            // barrier up iff the summary is a strict promise.
            assert_eq!(
                seg.sm.contains(AccessSet::READ),
                !seg.grey.inter(self.flipped_traces).is_empty()
            );
            assert_eq!(
                seg.sm.contains(AccessSet::WRITE),
                !seg.rank_set.is_empty() && !gc.summary.is_univ()
            );

            if let Some(buf) = gc.buffer {
                assert_eq!(self.buffers.get(buf.0).pool, seg.pool);
            }
        }
    }
}

fn access_names(set: AccessSet) -> String {
    let mut out = String::new();
    if set.contains(AccessSet::READ) {
        out.push_str(" read");
    }
    if set.contains(AccessSet::WRITE) {
        out.push_str(" write");
    }
    out
}

fn rank_names(set: RankSet) -> String {
    let mut out = String::new();
    for (rank, name) in [
        (Rank::Ambig, " ambiguous"),
        (Rank::Exact, " exact"),
        (Rank::Final, " final"),
        (Rank::Weak, " weak"),
    ] {
        if set.has(rank) {
            out.push_str(name);
        }
    }
    out
}

fn bits_of(set: TraceSet) -> u8 {
    set.iter().fold(0u8, |acc, ti| acc | (1 << ti.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::testing;
    use crate::set::TraceId;

    #[test]
    fn alloc_wires_tracts_and_free_unwires_them() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();

        let seg = state.seg_alloc(&SegPref::default(), 3 * grain, pool).unwrap();
        let base = state.seg_base(seg);
        assert_eq!(state.seg_size(seg), 3 * grain);
        assert_eq!(state.seg_of_addr(base + grain + 8), Some(seg));
        assert_eq!(state.pool_total_size(pool), 3 * grain);
        state.check();

        state.seg_free(seg);
        assert_eq!(state.seg_of_addr(base), None);
        assert_eq!(state.pool_total_size(pool), 0);
        state.check();
    }

    #[test]
    fn iteration_skips_inner_tracts() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();

        let a = state.seg_alloc(&SegPref::default(), 2 * grain, pool).unwrap();
        let b = state.seg_alloc(&SegPref::default(), grain, pool).unwrap();

        let first = state.seg_first().unwrap();
        assert_eq!(first, a);
        assert_eq!(state.seg_next(state.seg_base(a)), Some(b));
        assert_eq!(state.seg_next(state.seg_base(b)), None);
    }

    #[test]
    fn rank_transitions_drive_the_write_shield() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();
        let seg = state.seg_alloc(&SegPref::default(), grain, pool).unwrap();

        state.seg_set_rank_set(seg, RankSet::single(Rank::Exact));
        assert!(state.segs.get(seg.0).sm.contains(AccessSet::WRITE));
        state.check();

        state.seg_set_summary(seg, RefSet::UNIV);
        assert!(!state.segs.get(seg.0).sm.contains(AccessSet::WRITE));
        state.check();

        state.seg_set_summary(seg, RefSet::EMPTY);
        assert!(state.segs.get(seg.0).sm.contains(AccessSet::WRITE));

        state.seg_set_rank_set(seg, RankSet::EMPTY);
        assert!(state.segs.get(seg.0).sm.is_empty());
        state.check();

        state.seg_free(seg);
    }

    #[test]
    fn combined_rank_and_summary_adjusts_the_shield_once() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();
        let seg = state.seg_alloc(&SegPref::default(), grain, pool).unwrap();

        state.seg_set_rank_and_summary(seg, RankSet::single(Rank::Weak), RefSet::UNIV);
        assert!(state.segs.get(seg.0).sm.is_empty());

        state.seg_set_rank_and_summary(seg, RankSet::single(Rank::Weak), RefSet::EMPTY);
        assert!(state.segs.get(seg.0).sm.contains(AccessSet::WRITE));

        state.seg_set_rank_and_summary(seg, RankSet::EMPTY, RefSet::EMPTY);
        assert!(state.segs.get(seg.0).sm.is_empty());
        state.check();

        state.seg_free(seg);
    }

    #[test]
    fn whiteness_is_mirrored_on_every_tract() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();
        let seg = state.seg_alloc(&SegPref::default(), 4 * grain, pool).unwrap();
        let white = TraceSet::single(TraceId(1));

        state.seg_set_white(seg, white);
        let base = state.seg_base(seg);
        for index in state.tracts.range(base, state.seg_limit(seg)) {
            assert_eq!(state.tracts.tract(index).white, white);
        }

        state.seg_set_white(seg, TraceSet::EMPTY);
        state.seg_free(seg);
    }

    #[test]
    #[should_panic(expected = "no collection support")]
    fn colour_on_a_plain_segment_is_not_reached() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();
        let seg = state
            .seg_alloc_of_class(SegClass::Plain, &SegPref::default(), grain, pool)
            .unwrap();

        state.seg_set_white(seg, TraceSet::single(TraceId(0)));
    }

    #[test]
    fn descriptions_nest_by_depth() {
        let mut state = testing::state(1 << 20);
        let pool = state.pool_create_manual(16).unwrap();
        let grain = state.tracts.grain();
        let seg = state.seg_alloc(&SegPref::default(), grain, pool).unwrap();

        let mut out = String::new();
        state.seg_describe(seg, &mut out, 2).unwrap();
        assert!(out.starts_with("  Segment"));
        assert!(out.contains("ranks:"));

        state.seg_free(seg);
    }
}
