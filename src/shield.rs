//! The shield: mediates between the protection the barrier logic wants
//! (`sm`, the shield mode) and the protection actually enforced (`pm`).
//! Raising is lazy: `pm` catches up at the next flush, which happens at
//! the latest when the arena is left. Lowering and exposure drop `pm`
//! eagerly, so `pm ⊆ sm` holds at all times.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::Res;
use crate::seg::SegId;
use crate::set::AccessSet;

pub(crate) struct Shield {
    pub(crate) inside: bool,
    // Segments whose pm may lag sm, awaiting the next flush.
    pub(crate) queue: Vec<SegId>,
    // Total exposure count across all segments.
    pub(crate) exposed: u32,
}

impl Shield {
    pub(crate) fn new() -> Shield {
        Shield {
            inside: false,
            queue: Vec::new(),
            exposed: 0,
        }
    }
}

impl ArenaState {
    pub(crate) fn shield_enter(&mut self) {
        assert!(!self.shield.inside, "shield section entered twice");
        self.shield.inside = true;
    }

    pub(crate) fn shield_leave(&mut self) {
        assert!(self.shield.inside, "shield section left but never entered");
        assert_eq!(self.shield.exposed, 0, "leaving with exposed segments");
        // Protection is reconciled on exit so the mutator never runs
        // with a stale pm.
        self.shield_flush();
        self.shield.inside = false;
    }

    /// Request protection on a segment. The actual protection change is
    /// deferred to the next flush.
    pub(crate) fn shield_raise(&mut self, id: SegId, mode: AccessSet) {
        let seg = self.segs.get_mut(id.0);
        assert!(!seg.sm.intersects(mode), "mode already raised");
        seg.sm |= mode;
        if self.shield.inside {
            self.shield.queue.push(id);
        } else if seg.depth == 0 {
            seg.pm = seg.sm;
        }
    }

    /// Drop a protection request. Enforcement is removed eagerly, since
    /// running unprotected is always safe for the shield itself.
    pub(crate) fn shield_lower(&mut self, id: SegId, mode: AccessSet) {
        let seg = self.segs.get_mut(id.0);
        assert!(seg.sm.contains(mode), "mode is not raised");
        seg.sm &= !mode;
        seg.pm &= !mode;
    }

    /// Make a shielded segment temporarily accessible to the collector.
    pub(crate) fn shield_expose(&mut self, id: SegId) {
        assert!(self.shield.inside, "expose outside a shield section");
        let seg = self.segs.get_mut(id.0);
        seg.depth += 1;
        seg.pm = AccessSet::empty();
        self.shield.exposed += 1;
        self.shield.queue.push(id);
    }

    pub(crate) fn shield_cover(&mut self, id: SegId) {
        let seg = self.segs.get_mut(id.0);
        assert!(seg.depth > 0, "cover of an unexposed segment");
        seg.depth -= 1;
        self.shield.exposed -= 1;
        self.shield.queue.push(id);
    }

    /// Reconcile pm with sm for every queued segment that is not
    /// currently exposed. Pending entries may refer to segments freed
    /// in the meantime; those are skipped.
    pub(crate) fn shield_flush(&mut self) {
        let queue = std::mem::take(&mut self.shield.queue);
        for id in queue {
            if !self.segs.contains(id.0) {
                continue;
            }
            let seg = self.segs.get_mut(id.0);
            if seg.depth == 0 {
                seg.pm = seg.sm;
            }
        }
    }

    /// Teardown check: nothing exposed, nothing pending protection.
    pub(crate) fn shield_finish(&mut self) {
        self.shield_flush();
        assert_eq!(self.shield.exposed, 0);
        assert!(self.shield.queue.is_empty());
    }

    pub(crate) fn shield_describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        wline!(w, depth, "Shield")?;
        wline!(
            w,
            depth + 2,
            "{} shield section",
            if self.shield.inside { "inside" } else { "outside" }
        )?;
        wline!(w, depth + 2, "exposed {}", self.shield.exposed)?;
        wline!(w, depth + 2, "pending sync {}", self.shield.queue.len())
    }
}
