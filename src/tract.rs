//! The tract table: page-grain address-space management backing one
//! arena. The reservation is a single grain-aligned allocation; each
//! grain-sized cell (tract) carries the owning pool, an optional
//! segment back-pointer and the white trace set mirrored from its
//! segment.

use crate::config::ArenaConfig;
use crate::pool::PoolId;
use crate::res::{Res, ResErr};
use crate::seg::SegId;
use crate::set::{RefSet, TraceSet};
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// A machine address. Tracts, segments and client objects are all
/// identified by addresses inside the arena's reservation.
pub type Addr = usize;

/// Placement preference for segment allocation.
#[derive(Clone, Copy, Debug)]
pub struct SegPref {
    /// Prefer the high end of the reservation.
    pub high: bool,
    /// Acceptable zones. Falls back to any zone when no run fits.
    pub zones: RefSet,
}

impl SegPref {
    pub fn default() -> SegPref {
        SegPref {
            high: false,
            zones: RefSet::UNIV,
        }
    }

    pub fn high() -> SegPref {
        SegPref {
            high: true,
            zones: RefSet::UNIV,
        }
    }
}

pub(crate) struct Tract {
    pub(crate) pool: Option<PoolId>,
    pub(crate) seg: Option<SegId>,
    pub(crate) white: TraceSet,
}

// The reservation owns the backing memory for the whole arena. Zeroed
// so that conservative scans read defined words.
struct Reservation {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for Reservation {}

impl Drop for Reservation {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

pub(crate) struct TractTable {
    reservation: Reservation,
    grain: usize,
    count: usize,
    zone_shift: u32,
    zoned: bool,
    commit_limit: usize,
    committed: usize,
    tracts: Vec<Tract>,
    allocated: Vec<bool>,
}

fn round_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

impl TractTable {
    pub(crate) fn new(cfg: &ArenaConfig) -> Res<TractTable> {
        if !cfg.grain.is_power_of_two() || cfg.grain < 4096 || cfg.size == 0 {
            return Err(ResErr::Param);
        }
        let size = round_up(cfg.size, cfg.grain);
        let count = size / cfg.grain;
        let layout = Layout::from_size_align(size, cfg.grain).map_err(|_| ResErr::Param)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(ResErr::Memory)?;

        // 64 zones span the reservation, but a zone is never smaller
        // than a grain.
        let mut zone_shift = cfg.grain.trailing_zeros();
        while (1usize << zone_shift) * 64 < size {
            zone_shift += 1;
        }

        let mut tracts = Vec::with_capacity(count);
        for _ in 0..count {
            tracts.push(Tract {
                pool: None,
                seg: None,
                white: TraceSet::EMPTY,
            });
        }

        Ok(TractTable {
            reservation: Reservation { ptr, layout },
            grain: cfg.grain,
            count,
            zone_shift,
            zoned: cfg.zoned,
            commit_limit: cfg.commit_limit,
            committed: 0,
            tracts,
            allocated: vec![false; count],
        })
    }

    fn base(&self) -> Addr {
        self.reservation.ptr.as_ptr() as Addr
    }

    pub(crate) fn grain(&self) -> usize {
        self.grain
    }

    pub(crate) fn reserved(&self) -> usize {
        self.count * self.grain
    }

    pub(crate) fn committed(&self) -> usize {
        self.committed
    }

    pub(crate) fn commit_limit(&self) -> usize {
        self.commit_limit
    }

    pub(crate) fn zone_shift(&self) -> u32 {
        self.zone_shift
    }

    pub(crate) fn zone_of(&self, addr: Addr) -> u8 {
        ((addr >> self.zone_shift) & 63) as u8
    }

    pub(crate) fn base_of(&self, index: usize) -> Addr {
        debug_assert!(index < self.count);
        self.base() + index * self.grain
    }

    fn index_of(&self, addr: Addr) -> Option<usize> {
        if addr < self.base() {
            return None;
        }
        let index = (addr - self.base()) / self.grain;
        if index < self.count {
            Some(index)
        } else {
            None
        }
    }

    /// The tract covering `addr`, provided it is allocated to a pool.
    pub(crate) fn of_addr(&self, addr: Addr) -> Option<usize> {
        let index = self.index_of(addr)?;
        if self.allocated[index] {
            Some(index)
        } else {
            None
        }
    }

    pub(crate) fn tract(&self, index: usize) -> &Tract {
        debug_assert!(self.allocated[index]);
        &self.tracts[index]
    }

    pub(crate) fn tract_mut(&mut self, index: usize) -> &mut Tract {
        debug_assert!(self.allocated[index]);
        &mut self.tracts[index]
    }

    /// First allocated tract in address order.
    pub(crate) fn first(&self) -> Option<usize> {
        (0..self.count).find(|&i| self.allocated[i])
    }

    /// Next allocated tract whose base is strictly above `addr`.
    pub(crate) fn next(&self, addr: Addr) -> Option<usize> {
        let start = if addr < self.base() {
            0
        } else {
            (addr - self.base()) / self.grain + 1
        };
        (start..self.count).find(|&i| self.allocated[i])
    }

    fn run_fits(&self, start: usize, len: usize, zones: RefSet) -> bool {
        if start + len > self.count {
            return false;
        }
        for i in start..start + len {
            if self.allocated[i] {
                return false;
            }
            if self.zoned && !zones.has_zone(self.zone_of(self.base_of(i))) {
                return false;
            }
        }
        true
    }

    fn find_run(&self, len: usize, pref: &SegPref, zones: RefSet) -> Option<usize> {
        if pref.high {
            (0..self.count.saturating_sub(len - 1))
                .rev()
                .find(|&i| self.run_fits(i, len, zones))
        } else {
            (0..self.count.saturating_sub(len - 1)).find(|&i| self.run_fits(i, len, zones))
        }
    }

    /// Allocate `size` bytes of contiguous tracts for `pool`, honouring
    /// the placement preference where possible.
    pub(crate) fn alloc(&mut self, pref: &SegPref, size: usize, pool: PoolId) -> Res<Addr> {
        assert!(size > 0 && size % self.grain == 0);
        let len = size / self.grain;

        if self.committed + size > self.commit_limit {
            return Err(ResErr::CommitLimit);
        }

        let start = self
            .find_run(len, pref, pref.zones)
            .or_else(|| self.find_run(len, pref, RefSet::UNIV))
            .ok_or(ResErr::Memory)?;

        for i in start..start + len {
            self.allocated[i] = true;
            let tract = &mut self.tracts[i];
            tract.pool = Some(pool);
            tract.seg = None;
            tract.white = TraceSet::EMPTY;
        }
        self.committed += size;
        Ok(self.base_of(start))
    }

    /// Return a tract range to the table. The range must be exactly one
    /// previous allocation by `pool` with no segments left on it.
    pub(crate) fn free(&mut self, base: Addr, size: usize, pool: PoolId) {
        assert!(size > 0 && size % self.grain == 0);
        assert!(base % self.grain == 0);
        let start = self.index_of(base).expect("free of an address outside the arena");
        let len = size / self.grain;
        assert!(start + len <= self.count);

        for i in start..start + len {
            assert!(self.allocated[i]);
            let tract = &mut self.tracts[i];
            assert_eq!(tract.pool, Some(pool));
            assert!(tract.seg.is_none(), "tract still carries a segment");
            tract.pool = None;
            tract.white = TraceSet::EMPTY;
            self.allocated[i] = false;
        }
        self.committed -= size;
    }

    /// Walk the tract indices covering `[base, limit)`.
    pub(crate) fn range(&self, base: Addr, limit: Addr) -> std::ops::Range<usize> {
        assert!(base % self.grain == 0 && limit % self.grain == 0);
        let start = self.index_of(base).expect("range base outside the arena");
        let len = (limit - base) / self.grain;
        assert!(start + len <= self.count);
        start..start + len
    }

    pub(crate) fn has_addr(&self, addr: Addr) -> bool {
        self.index_of(addr).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(size: usize) -> TractTable {
        let mut cfg = ArenaConfig::with_size(size);
        cfg.commit_limit = size;
        TractTable::new(&cfg).unwrap()
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let mut table = table(1 << 20);
        let pool = PoolId(0);
        let grain = table.grain();

        let base = table.alloc(&SegPref::default(), 4 * grain, pool).unwrap();
        assert_eq!(base % grain, 0);
        assert_eq!(table.committed(), 4 * grain);
        assert!(table.of_addr(base + grain).is_some());

        table.free(base, 4 * grain, pool);
        assert_eq!(table.committed(), 0);
        assert!(table.of_addr(base).is_none());
    }

    #[test]
    fn commit_limit_is_enforced() {
        let mut cfg = ArenaConfig::with_size(1 << 20);
        cfg.commit_limit = 8 * cfg.grain;
        let mut table = TractTable::new(&cfg).unwrap();
        let pool = PoolId(0);

        table.alloc(&SegPref::default(), 8 * cfg.grain, pool).unwrap();
        let res = table.alloc(&SegPref::default(), cfg.grain, pool);
        assert_eq!(res, Err(ResErr::CommitLimit));
    }

    #[test]
    fn high_preference_allocates_from_the_top() {
        let mut table = table(1 << 20);
        let pool = PoolId(0);
        let grain = table.grain();

        let low = table.alloc(&SegPref::default(), grain, pool).unwrap();
        let high = table.alloc(&SegPref::high(), grain, pool).unwrap();
        assert!(high > low);
        assert_eq!(high, table.base_of(table.reserved() / grain - 1));
    }

    #[test]
    fn next_walks_in_address_order() {
        let mut table = table(1 << 20);
        let pool = PoolId(0);
        let grain = table.grain();

        let a = table.alloc(&SegPref::default(), grain, pool).unwrap();
        let b = table.alloc(&SegPref::high(), grain, pool).unwrap();

        let first = table.first().unwrap();
        assert_eq!(table.base_of(first), a);
        let next = table.next(a).unwrap();
        assert_eq!(table.base_of(next), b);
        assert!(table.next(b).is_none());
    }
}
