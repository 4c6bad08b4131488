//! Small set types threaded through the whole crate: trace sets, rank
//! sets, protection mode sets and reference (zone) summaries.

use bitflags::bitflags;
use std::fmt;

/// Capacity of the per-arena trace table.
pub const TRACE_MAX: usize = 4;

/// Index of a trace in the arena's trace table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId(pub u8);

impl TraceId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A set of trace ids, one bit per trace table slot.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TraceSet(u8);

impl TraceSet {
    pub const EMPTY: TraceSet = TraceSet(0);
    pub const UNIV: TraceSet = TraceSet((1 << TRACE_MAX) - 1);

    pub fn single(ti: TraceId) -> TraceSet {
        assert!(ti.index() < TRACE_MAX);
        TraceSet(1 << ti.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn has(self, ti: TraceId) -> bool {
        self.0 & (1 << ti.0) != 0
    }

    pub fn add(self, ti: TraceId) -> TraceSet {
        TraceSet(self.0 | (1 << ti.0))
    }

    pub fn del(self, ti: TraceId) -> TraceSet {
        TraceSet(self.0 & !(1 << ti.0))
    }

    pub fn union(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 | other.0)
    }

    pub fn inter(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & other.0)
    }

    pub fn diff(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & !other.0)
    }

    /// Is `self` a subset of `other`?
    pub fn sub(self, other: TraceSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn iter(self) -> impl Iterator<Item = TraceId> {
        (0..TRACE_MAX as u8)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(TraceId)
    }
}

impl fmt::Debug for TraceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceSet({:#06b})", self.0)
    }
}

/// Reference strength class. The order is the scanning order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Rank {
    Ambig = 0,
    Exact = 1,
    Final = 2,
    Weak = 3,
}

pub const RANK_COUNT: usize = 4;

impl Rank {
    pub const ALL: [Rank; RANK_COUNT] = [Rank::Ambig, Rank::Exact, Rank::Final, Rank::Weak];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A set of ranks. A segment's rank set is empty or a singleton.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RankSet(u8);

impl RankSet {
    pub const EMPTY: RankSet = RankSet(0);

    pub fn single(rank: Rank) -> RankSet {
        RankSet(1 << rank as u8)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    pub fn has(self, rank: Rank) -> bool {
        self.0 & (1 << rank as u8) != 0
    }

    /// The rank of a singleton set.
    pub fn the_rank(self) -> Option<Rank> {
        if !self.is_single() {
            return None;
        }
        Rank::ALL.into_iter().find(|r| self.has(*r))
    }
}

impl fmt::Debug for RankSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RankSet({:#06b})", self.0)
    }
}

bitflags! {
    /// Protection modes, both requested (`sm`) and enforced (`pm`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessSet: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// An overapproximation of a set of reference targets, kept as one bit
/// per address zone. The zone of an address is `(addr >> shift) & 63`,
/// where the shift is chosen by the tract table so that 64 zones cover
/// the reservation.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RefSet(u64);

impl RefSet {
    pub const EMPTY: RefSet = RefSet(0);
    pub const UNIV: RefSet = RefSet(!0);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_univ(self) -> bool {
        self.0 == !0
    }

    pub fn add_zone(self, zone: u8) -> RefSet {
        RefSet(self.0 | (1 << (zone & 63)))
    }

    pub fn union(self, other: RefSet) -> RefSet {
        RefSet(self.0 | other.0)
    }

    pub fn has_zone(self, zone: u8) -> bool {
        self.0 & (1 << (zone & 63)) != 0
    }

    /// Is `self` a superset of `other`?
    pub fn super_of(self, other: RefSet) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn bits(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for RefSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefSet({:#018x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_set_ops() {
        let t0 = TraceId(0);
        let t2 = TraceId(2);
        let set = TraceSet::EMPTY.add(t0).add(t2);

        assert!(set.has(t0));
        assert!(!set.has(TraceId(1)));
        assert_eq!(set.del(t0), TraceSet::single(t2));
        assert!(set.sub(TraceSet::UNIV));
        assert!(!TraceSet::UNIV.sub(set));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![t0, t2]);
    }

    #[test]
    fn trace_set_inter_diff() {
        let a = TraceSet::single(TraceId(0)).add(TraceId(1));
        let b = TraceSet::single(TraceId(1)).add(TraceId(3));

        assert_eq!(a.inter(b), TraceSet::single(TraceId(1)));
        assert_eq!(a.diff(b), TraceSet::single(TraceId(0)));
        assert!(a.inter(TraceSet::EMPTY).is_empty());
    }

    #[test]
    fn rank_set_singleton() {
        let set = RankSet::single(Rank::Exact);

        assert!(set.is_single());
        assert_eq!(set.the_rank(), Some(Rank::Exact));
        assert_eq!(RankSet::EMPTY.the_rank(), None);
    }

    #[test]
    fn ref_set_zones() {
        let set = RefSet::EMPTY.add_zone(3).add_zone(63);

        assert!(set.has_zone(3));
        assert!(!set.has_zone(4));
        assert!(RefSet::UNIV.super_of(set));
        assert!(!set.super_of(RefSet::UNIV));
        assert!(set.super_of(RefSet::EMPTY));
    }
}
