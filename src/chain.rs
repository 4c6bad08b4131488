//! Generation chains and the collection history. A chain describes the
//! generations a set of collected pools age through; the history keeps
//! a short record of recent collections for the policy module.

use crate::arena::ArenaState;
use crate::describe::wline;
use crate::res::Res;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainId(pub(crate) u32);

#[derive(Debug, Clone, Copy)]
pub struct GenParam {
    /// Bytes of new allocation the generation tolerates before it wants
    /// collecting.
    pub capacity: usize,
    /// Expected fraction of the generation dying per collection.
    pub mortality: f64,
}

pub(crate) struct Chain {
    pub(crate) serial: u64,
    pub(crate) gens: Vec<GenParam>,
    // New allocation on pools using this chain since the last trace.
    pub(crate) new_size: usize,
}

impl ArenaState {
    pub(crate) fn chain_create(&mut self, gens: Vec<GenParam>) -> ChainId {
        assert!(!gens.is_empty());
        assert!(gens.iter().all(|g| g.capacity > 0));
        assert!(gens.iter().all(|g| (0.0..=1.0).contains(&g.mortality)));
        let serial = self.chain_serial;
        self.chain_serial += 1;
        let id = ChainId(self.chains.insert(Chain {
            serial,
            gens,
            new_size: 0,
        }));
        self.chain_ring.push(id);
        id
    }

    pub(crate) fn chain_destroy(&mut self, id: ChainId) {
        let at = self
            .chain_ring
            .iter()
            .position(|c| *c == id)
            .expect("chain not on the arena ring");
        self.chain_ring.swap_remove(at);
        self.chains.remove(id.0);
    }

    /// Note new allocation against the default chain; feeds the policy
    /// decision to start a trace.
    pub(crate) fn chain_note_fill(&mut self, size: usize) {
        if let Some(id) = self.default_chain {
            self.chains.get_mut(id.0).new_size += size;
        }
    }

    pub(crate) fn chain_reset_fill(&mut self) {
        if let Some(id) = self.default_chain {
            self.chains.get_mut(id.0).new_size = 0;
        }
    }

    pub(crate) fn chain_describe(
        &self,
        id: ChainId,
        w: &mut dyn std::fmt::Write,
        depth: usize,
    ) -> Res<()> {
        let chain = self.chains.get(id.0);
        wline!(w, depth, "Chain {} (serial {})", id.0, chain.serial)?;
        for (i, gen) in chain.gens.iter().enumerate() {
            wline!(
                w,
                depth + 2,
                "gen {i}: capacity {} kB, mortality {:.2}",
                gen.capacity / 1024,
                gen.mortality
            )?;
        }
        wline!(w, depth + 2, "new allocation {} kB", chain.new_size / 1024)
    }
}

const HISTORY_LEN: usize = 8;

/// Recent collection work, bounded; used by the policy to pace polls.
pub(crate) struct History {
    pub(crate) epoch: u64,
    samples: VecDeque<(f64, Duration)>,
}

impl History {
    pub(crate) fn new() -> History {
        History {
            epoch: 0,
            samples: VecDeque::with_capacity(HISTORY_LEN),
        }
    }

    pub(crate) fn record(&mut self, work: f64, elapsed: Duration) {
        self.epoch += 1;
        if self.samples.len() == HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back((work, elapsed));
    }

    pub(crate) fn describe(&self, w: &mut dyn std::fmt::Write, depth: usize) -> Res<()> {
        wline!(w, depth, "History")?;
        wline!(w, depth + 2, "epoch {}", self.epoch)?;
        for (work, elapsed) in &self.samples {
            wline!(w, depth + 2, "work {work:.0} in {}us", elapsed.as_micros())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_is_bounded() {
        let mut history = History::new();
        for i in 0..20 {
            history.record(i as f64, Duration::from_millis(1));
        }
        assert_eq!(history.epoch, 20);
        assert_eq!(history.samples.len(), HISTORY_LEN);
        assert_eq!(history.samples.back().unwrap().0, 19.0);
    }
}
