//! Allocation buffers: per-client allocation points that carve one
//! segment at a time. Allocation is two-phase (reserve, then commit) so
//! a client can initialise an object before it becomes reachable.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::pool::PoolId;
use crate::res::Res;
use crate::seg::SegId;
use crate::set::{Rank, RankSet};
use crate::tract::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufId(pub(crate) u32);

pub(crate) struct Buffer {
    pub(crate) serial: u64,
    pub(crate) pool: PoolId,
    pub(crate) rank: Rank,
    pub(crate) seg: Option<SegId>,
    // The current run: base of the filled range, the allocation point,
    // and its limit. Empty when seg is None.
    pub(crate) base: Addr,
    pub(crate) init: Addr,
    pub(crate) limit: Addr,
    // Outstanding reserve, if any.
    pub(crate) pending: Option<(Addr, usize)>,
}

// How much a fill grabs beyond the immediate request, in grains.
const FILL_QUANTUM_GRAINS: usize = 4;

impl ArenaState {
    pub(crate) fn buffer_create(&mut self, pool: PoolId, rank: Rank) -> Res<BufId> {
        assert!(self.pools.contains(pool.0));
        let serial = self.buffer_serial;
        self.buffer_serial += 1;
        Ok(BufId(self.buffers.insert(Buffer {
            serial,
            pool,
            rank,
            seg: None,
            base: 0,
            init: 0,
            limit: 0,
            pending: None,
        })))
    }

    pub(crate) fn buffer_destroy(&mut self, id: BufId) {
        assert!(
            self.buffers.get(id.0).pending.is_none(),
            "destroying a buffer with an outstanding reserve"
        );
        self.buffer_empty(id);
        self.buffers.remove(id.0);
    }

    /// Reserve `size` bytes at the allocation point, refilling from the
    /// pool when the current run is too small. The reservation is not
    /// an allocation until committed.
    pub(crate) fn buffer_reserve(&mut self, id: BufId, size: usize) -> Res<Addr> {
        assert!(size > 0);
        assert!(
            self.buffers.get(id.0).pending.is_none(),
            "reserve with a reserve outstanding"
        );
        let pool = self.buffers.get(id.0).pool;
        let aligned = {
            let alignment = self.pools.get(pool.0).alignment;
            (size + alignment - 1) & !(alignment - 1)
        };

        if self.buffers.get(id.0).init + aligned > self.buffers.get(id.0).limit
            || self.buffers.get(id.0).seg.is_none()
        {
            self.buffer_fill(id, aligned)?;
        }

        let buffer = self.buffers.get_mut(id.0);
        let addr = buffer.init;
        debug_assert!(addr + aligned <= buffer.limit);
        buffer.pending = Some((addr, aligned));
        Ok(addr)
    }

    /// Commit the outstanding reservation. Always succeeds in this
    /// non-moving arena; the two-phase protocol is kept so clients are
    /// written against the general contract.
    pub(crate) fn buffer_commit(&mut self, id: BufId, addr: Addr, size: usize) -> bool {
        let pool = self.buffers.get(id.0).pool;
        let aligned = {
            let alignment = self.pools.get(pool.0).alignment;
            (size + alignment - 1) & !(alignment - 1)
        };
        let buffer = self.buffers.get_mut(id.0);
        let (pending_addr, pending_size) =
            buffer.pending.take().expect("commit without a reserve");
        assert_eq!(addr, pending_addr);
        assert_eq!(aligned, pending_size);

        buffer.init += aligned;
        self.account_alloc_mutator(aligned as f64);
        true
    }

    /// How many reserved-but-uncommitted bytes the current run still
    /// holds.
    pub(crate) fn buffer_free(&self, id: BufId) -> usize {
        let buffer = self.buffers.get(id.0);
        buffer.limit - buffer.init
    }

    /// Attach a fresh run from the pool, returning the tail of the old
    /// run first.
    fn buffer_fill(&mut self, id: BufId, need: usize) -> Res<()> {
        self.buffer_empty(id);

        let pool = self.buffers.get(id.0).pool;
        let quantum = FILL_QUANTUM_GRAINS * self.tracts.grain();
        let (seg, base, got) = self.pool_take(pool, need, quantum)?;

        assert!(self.seg_buffer(seg).is_none(), "segment is already buffered");
        // A ranked segment only takes an allocation point of its own
        // rank.
        let seg_rank = self.segs.get(seg.0).rank_set;
        if !seg_rank.is_empty() {
            assert_eq!(seg_rank, RankSet::single(self.buffers.get(id.0).rank));
        }
        self.seg_set_buffer(seg, Some(id));

        let buffer = self.buffers.get_mut(id.0);
        buffer.seg = Some(seg);
        buffer.base = base;
        buffer.init = base;
        buffer.limit = base + got;
        self.account_fill_mutator(got as f64);

        if self.pools.get(pool.0).has_gc_attr() {
            self.chain_note_fill(got);
        }
        Ok(())
    }

    /// Detach from the current run, handing the unused tail back to the
    /// pool.
    pub(crate) fn buffer_empty(&mut self, id: BufId) {
        let (seg, init, limit, pool) = {
            let buffer = self.buffers.get(id.0);
            match buffer.seg {
                Some(seg) => (seg, buffer.init, buffer.limit, buffer.pool),
                None => return,
            }
        };

        self.seg_set_buffer(seg, None);
        {
            let buffer = self.buffers.get_mut(id.0);
            buffer.seg = None;
            buffer.base = 0;
            buffer.init = 0;
            buffer.limit = 0;
        }

        if limit > init {
            self.pool_free(pool, init, limit - init);
        }
        self.account_empty_mutator((limit - init) as f64);
    }

    pub(crate) fn buffer_describe(
        &self,
        id: BufId,
        w: &mut dyn std::fmt::Write,
        depth: usize,
    ) -> Res<()> {
        let buffer = self.buffers.get(id.0);
        wline!(w, depth, "Buffer {} (serial {})", id.0, buffer.serial)?;
        wline!(w, depth + 2, "pool {}", buffer.pool.0)?;
        match buffer.seg {
            Some(seg) => {
                wline!(w, depth + 2, "seg {}", seg.0)?;
                wline!(
                    w,
                    depth + 2,
                    "run [{:#x},{:#x}) init {:#x}",
                    buffer.base,
                    buffer.limit,
                    buffer.init
                )
            }
            None => wline!(w, depth + 2, "detached"),
        }
    }
}

// A failed fill must not leave the buffer half-attached.
impl ArenaState {
    pub(crate) fn buffer_check(&self, id: BufId) {
        let buffer = self.buffers.get(id.0);
        match buffer.seg {
            Some(seg) => {
                assert_eq!(self.seg_buffer(seg), Some(id));
                assert!(self.seg_base(seg) <= buffer.base);
                assert!(buffer.base <= buffer.init);
                assert!(buffer.init <= buffer.limit);
                assert!(buffer.limit <= self.seg_limit(seg));
            }
            None => {
                assert_eq!(buffer.init, buffer.limit);
            }
        }
    }
}
