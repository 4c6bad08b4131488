//! Client registries: roots (ranges of client memory the tracer scans),
//! mutator threads (live and dead rings) and object formats.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::{Res, ResErr};
use crate::set::{AccessSet, Rank};
use crate::tract::Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(pub(crate) u32);

pub(crate) struct Root {
    pub(crate) serial: u64,
    pub(crate) base: Addr,
    pub(crate) limit: Addr,
    pub(crate) rank: Rank,
    // Protection currently enforced on the root's range.
    pub(crate) pm: AccessSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatId(pub(crate) u32);

pub(crate) struct Format {
    pub(crate) serial: u64,
    pub(crate) alignment: usize,
}

pub(crate) struct ThreadReg {
    pub(crate) serial: u64,
}

impl ArenaState {
    pub(crate) fn root_create(&mut self, base: Addr, limit: Addr, rank: Rank) -> Res<RootId> {
        if base >= limit {
            return Err(ResErr::Param);
        }
        let serial = self.root_serial;
        self.root_serial += 1;
        let id = RootId(self.roots.insert(Root {
            serial,
            base,
            limit,
            rank,
            pm: AccessSet::empty(),
        }));
        self.root_ring.push(id);
        Ok(id)
    }

    pub(crate) fn root_destroy(&mut self, id: RootId) {
        let at = self
            .root_ring
            .iter()
            .position(|r| *r == id)
            .expect("root not on the arena ring");
        self.root_ring.swap_remove(at);
        self.roots.remove(id.0);
    }

    pub(crate) fn root_of_addr(&self, addr: Addr) -> Option<RootId> {
        self.root_ring
            .iter()
            .copied()
            .find(|id| {
                let root = self.roots.get(id.0);
                root.base <= addr && addr < root.limit
            })
    }

    pub(crate) fn root_pm(&self, id: RootId) -> AccessSet {
        self.roots.get(id.0).pm
    }

    /// Handle an access fault on a protected root: drop the protection
    /// the access needs.
    pub(crate) fn root_access(&mut self, id: RootId, mode: AccessSet) {
        let root = self.roots.get_mut(id.0);
        root.pm &= !mode;
    }

    pub(crate) fn roots_describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        wline!(w, depth, "Roots")?;
        for id in &self.root_ring {
            let root = self.roots.get(id.0);
            wline!(
                w,
                depth + 2,
                "root {} [{:#x},{:#x}) rank {:?}",
                root.serial,
                root.base,
                root.limit,
                root.rank
            )?;
        }
        Ok(())
    }

    pub(crate) fn thread_register(&mut self) -> u64 {
        let serial = self.thread_serial;
        self.thread_serial += 1;
        self.threads.push(ThreadReg { serial });
        serial
    }

    /// Deregistration moves the record to the dead ring rather than
    /// dropping it, so late faults can still be attributed.
    pub(crate) fn thread_deregister(&mut self, serial: u64) {
        let at = self
            .threads
            .iter()
            .position(|t| t.serial == serial)
            .expect("thread is not registered");
        let reg = self.threads.swap_remove(at);
        self.dead_threads.push(reg);
    }

    pub(crate) fn format_create(&mut self, alignment: usize) -> Res<FormatId> {
        if !alignment.is_power_of_two() {
            return Err(ResErr::Param);
        }
        let serial = self.format_serial;
        self.format_serial += 1;
        let id = FormatId(self.formats.insert(Format { serial, alignment }));
        self.format_ring.push(id);
        Ok(id)
    }

    pub(crate) fn format_destroy(&mut self, id: FormatId) {
        let at = self
            .format_ring
            .iter()
            .position(|f| *f == id)
            .expect("format not on the arena ring");
        self.format_ring.swap_remove(at);
        self.formats.remove(id.0);
    }
}
