//! Pools: allocation strategies bound to sets of segments. The pool
//! header and free-list mechanics are shared; the class supplies the
//! strategy. Three classes are provided: a manual first-fit pool, an
//! automatically collected pool, and the guardian pool the arena uses
//! for finalization registrations.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::{Res, ResErr};
use crate::seg::SegId;
use crate::set::{Rank, RankSet, RefSet};
use crate::tract::{Addr, SegPref};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(pub(crate) u32);

#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    seg: SegId,
    base: Addr,
    size: usize,
}

/// An address-ordered free list. Blocks never span segments, so a block
/// handed to a buffer always lies inside a single segment.
pub(crate) struct FreeList {
    blocks: Vec<FreeBlock>,
}

impl FreeList {
    fn new() -> FreeList {
        FreeList { blocks: Vec::new() }
    }

    fn total(&self) -> usize {
        self.blocks.iter().map(|b| b.size).sum()
    }

    fn insert(&mut self, seg: SegId, base: Addr, size: usize) {
        assert!(size > 0);
        let at = self
            .blocks
            .partition_point(|b| b.base < base);
        if at > 0 {
            let prev = &self.blocks[at - 1];
            assert!(prev.base + prev.size <= base, "double free");
        }
        if at < self.blocks.len() {
            assert!(base + size <= self.blocks[at].base, "double free");
        }

        self.blocks.insert(at, FreeBlock { seg, base, size });

        // Coalesce with the neighbour above, then below, but never
        // across a segment boundary.
        if at + 1 < self.blocks.len()
            && self.blocks[at].seg == self.blocks[at + 1].seg
            && self.blocks[at].base + self.blocks[at].size == self.blocks[at + 1].base
        {
            let next = self.blocks.remove(at + 1);
            self.blocks[at].size += next.size;
        }
        if at > 0
            && self.blocks[at - 1].seg == self.blocks[at].seg
            && self.blocks[at - 1].base + self.blocks[at - 1].size == self.blocks[at].base
        {
            let cur = self.blocks.remove(at);
            self.blocks[at - 1].size += cur.size;
        }
    }

    fn fits(&self, need: usize) -> bool {
        self.blocks.iter().any(|b| b.size >= need)
    }

    /// First-fit take: carve up to `max(need, quantum)` (clamped to the
    /// block) off the front of the first block that can hold `need`.
    fn take(&mut self, need: usize, quantum: usize) -> Option<(SegId, Addr, usize)> {
        let at = self.blocks.iter().position(|b| b.size >= need)?;
        let block = self.blocks[at];
        let taken = need.max(quantum).min(block.size);

        if taken == block.size {
            self.blocks.remove(at);
        } else {
            self.blocks[at].base += taken;
            self.blocks[at].size -= taken;
        }
        Some((block.seg, block.base, taken))
    }
}

pub(crate) struct GuardianPool {
    // Registered references, kept alive for finalization ordering.
    pub(crate) guards: Vec<Addr>,
}

pub(crate) enum PoolClass {
    Manual(FreeList),
    Auto { free: FreeList, rank: Rank },
    Guardian(GuardianPool),
}

pub(crate) struct Pool {
    pub(crate) serial: u64,
    pub(crate) class: PoolClass,
    pub(crate) alignment: usize,
    pub(crate) pref: SegPref,
    pub(crate) seg_ring: Vec<SegId>,
    pub(crate) total_size: usize,
    pub(crate) free_size: usize,
}

impl Pool {
    pub(crate) fn has_gc_attr(&self) -> bool {
        matches!(self.class, PoolClass::Auto { .. })
    }

    fn class_name(&self) -> &'static str {
        match self.class {
            PoolClass::Manual(_) => "manual",
            PoolClass::Auto { .. } => "auto",
            PoolClass::Guardian(_) => "guardian",
        }
    }
}

fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

impl ArenaState {
    fn pool_create(&mut self, class: PoolClass, alignment: usize) -> Res<PoolId> {
        if !alignment.is_power_of_two() || alignment < std::mem::size_of::<usize>() {
            return Err(ResErr::Param);
        }
        let serial = self.pool_serial;
        self.pool_serial += 1;
        let id = PoolId(self.pools.insert(Pool {
            serial,
            class,
            alignment,
            pref: SegPref::default(),
            seg_ring: Vec::new(),
            total_size: 0,
            free_size: 0,
        }));
        self.pool_ring.push(id);
        Ok(id)
    }

    /// Create a manually managed first-fit pool.
    pub(crate) fn pool_create_manual(&mut self, alignment: usize) -> Res<PoolId> {
        self.pool_create(PoolClass::Manual(FreeList::new()), alignment)
    }

    /// Create an automatically collected pool whose segments hold
    /// references of the given rank.
    pub(crate) fn pool_create_auto(&mut self, rank: Rank) -> Res<PoolId> {
        self.pool_create(
            PoolClass::Auto {
                free: FreeList::new(),
                rank,
            },
            std::mem::size_of::<usize>(),
        )
    }

    pub(crate) fn pool_create_guardian(&mut self) -> Res<PoolId> {
        self.pool_create(
            PoolClass::Guardian(GuardianPool { guards: Vec::new() }),
            std::mem::size_of::<usize>(),
        )
    }

    /// Destroy a pool and free all its segments. Buffers must have been
    /// destroyed first.
    pub(crate) fn pool_destroy(&mut self, id: PoolId) {
        assert!(
            self.buffers.iter().all(|(_, b)| b.pool != id),
            "pool still has buffers"
        );

        for seg in self.pools.get(id.0).seg_ring.clone() {
            self.seg_free(seg);
        }
        assert!(self.pools.get(id.0).seg_ring.is_empty());

        let at = self
            .pool_ring
            .iter()
            .position(|p| *p == id)
            .expect("pool not on the arena ring");
        self.pool_ring.swap_remove(at);
        self.pools.remove(id.0);
    }

    /// Grow a pool by one segment big enough for `need` bytes, putting
    /// the whole range on the free list.
    pub(crate) fn pool_grow(&mut self, id: PoolId, need: usize) -> Res<SegId> {
        let grain = self.tracts.grain();
        let size = align_up(need.max(grain), grain);
        let pref = self.pools.get(id.0).pref;
        let seg = self.seg_alloc(&pref, size, id)?;

        // Auto segments carry their rank from birth; the universal
        // summary keeps the write barrier down until the tracer narrows
        // it.
        if let PoolClass::Auto { rank, .. } = self.pools.get(id.0).class {
            self.seg_set_rank_and_summary(seg, RankSet::single(rank), RefSet::UNIV);
        }

        let base = self.seg_base(seg);
        let pool = self.pools.get_mut(id.0);
        pool.free_size += size;
        match &mut pool.class {
            PoolClass::Manual(free) => free.insert(seg, base, size),
            PoolClass::Auto { free, .. } => free.insert(seg, base, size),
            PoolClass::Guardian(_) => panic!("guardian pools do not grow"),
        }
        Ok(seg)
    }

    /// Direct allocation from a pool's free list, growing on demand.
    pub(crate) fn pool_alloc(&mut self, id: PoolId, size: usize) -> Res<Addr> {
        assert!(size > 0);
        let aligned = align_up(size, self.pools.get(id.0).alignment);

        if !self.pool_free_list(id).fits(aligned) {
            self.pool_grow(id, aligned)?;
        }
        let (_, base, taken) = self
            .pool_free_list(id)
            .take(aligned, 0)
            .ok_or(ResErr::Memory)?;
        debug_assert_eq!(taken, aligned);
        self.pools.get_mut(id.0).free_size -= aligned;
        Ok(base)
    }

    /// Return a block to the pool. The size must be the one allocated.
    pub(crate) fn pool_free(&mut self, id: PoolId, addr: Addr, size: usize) {
        assert!(size > 0);
        let aligned = align_up(size, self.pools.get(id.0).alignment);
        let seg = self
            .seg_of_addr(addr)
            .expect("free of an address outside the arena");
        assert_eq!(self.seg_pool(seg), id);
        assert!(addr + aligned <= self.seg_limit(seg));

        self.pool_free_list(id).insert(seg, addr, aligned);
        self.pools.get_mut(id.0).free_size += aligned;
    }

    fn pool_free_list(&mut self, id: PoolId) -> &mut FreeList {
        match &mut self.pools.get_mut(id.0).class {
            PoolClass::Manual(free) => free,
            PoolClass::Auto { free, .. } => free,
            PoolClass::Guardian(_) => panic!("guardian pools have no free list"),
        }
    }

    /// First-fit take for buffer fills; carves a quantum-sized run.
    pub(crate) fn pool_take(
        &mut self,
        id: PoolId,
        need: usize,
        quantum: usize,
    ) -> Res<(SegId, Addr, usize)> {
        if let Some(run) = self.pool_free_list(id).take(need, quantum) {
            self.pools.get_mut(id.0).free_size -= run.2;
            return Ok(run);
        }
        self.pool_grow(id, need)?;
        let run = self
            .pool_free_list(id)
            .take(need, quantum)
            .expect("fresh segment cannot satisfy the fill");
        self.pools.get_mut(id.0).free_size -= run.2;
        Ok(run)
    }

    pub(crate) fn pool_total_size(&self, id: PoolId) -> usize {
        self.pools.get(id.0).total_size
    }

    pub(crate) fn pool_free_size(&self, id: PoolId) -> usize {
        self.pools.get(id.0).free_size
    }

    pub(crate) fn pool_has_gc(&self, id: PoolId) -> bool {
        self.pools.get(id.0).has_gc_attr()
    }

    pub(crate) fn pool_of_addr(&self, addr: Addr) -> Option<PoolId> {
        let index = self.tracts.of_addr(addr)?;
        self.tracts.tract(index).pool
    }

    pub(crate) fn guardian_register(&mut self, id: PoolId, obj: Addr) -> Res<()> {
        match &mut self.pools.get_mut(id.0).class {
            PoolClass::Guardian(guardian) => {
                guardian.guards.push(obj);
                Ok(())
            }
            _ => panic!("not a guardian pool"),
        }
    }

    pub(crate) fn guardian_deregister(&mut self, id: PoolId, obj: Addr) -> Res<()> {
        match &mut self.pools.get_mut(id.0).class {
            PoolClass::Guardian(guardian) => {
                match guardian.guards.iter().position(|g| *g == obj) {
                    Some(at) => {
                        guardian.guards.swap_remove(at);
                        Ok(())
                    }
                    None => Err(ResErr::Fail),
                }
            }
            _ => panic!("not a guardian pool"),
        }
    }

    pub(crate) fn pool_describe(
        &self,
        id: PoolId,
        w: &mut dyn std::fmt::Write,
        depth: usize,
    ) -> Res<()> {
        let pool = self.pools.get(id.0);
        wline!(w, depth, "Pool {} (serial {})", id.0, pool.serial)?;
        wline!(w, depth + 2, "class {}", pool.class_name())?;
        wline!(w, depth + 2, "alignment {}", pool.alignment)?;
        wline!(w, depth + 2, "total {} kB", pool.total_size / 1024)?;
        wline!(w, depth + 2, "free {} kB", pool.free_size / 1024)?;
        wline!(w, depth + 2, "segments {}", pool.seg_ring.len())?;
        for seg in &pool.seg_ring {
            self.seg_describe(*seg, w, depth + 2)?;
        }
        Ok(())
    }

    /// Pool accounting consistency, part of the arena check battery.
    pub(crate) fn pool_check(&self, id: PoolId) {
        let pool = self.pools.get(id.0);
        assert!(pool.free_size <= pool.total_size);
        let ring_total: usize = pool.seg_ring.iter().map(|s| self.seg_size(*s)).sum();
        assert_eq!(ring_total, pool.total_size);
        for seg in &pool.seg_ring {
            assert_eq!(self.seg_pool(*seg), id);
        }
        let free = match &pool.class {
            PoolClass::Manual(free) => Some(free),
            PoolClass::Auto { free, .. } => Some(free),
            PoolClass::Guardian(_) => None,
        };
        if let Some(free) = free {
            let buffered: usize = self
                .buffers
                .iter()
                .filter(|(_, b)| b.pool == id)
                .map(|(_, b)| b.limit - b.init)
                .sum();
            assert_eq!(free.total(), pool.free_size);
            assert!(pool.free_size + buffered <= pool.total_size);
        }
    }
}
