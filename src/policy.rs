//! Collection policy: when to poll, how long to keep polling, and when
//! a collection is worth starting. Deliberately simple and
//! deterministic; the decisions are thresholds over the arena's
//! accounting, not estimators.

use crate::arena::ArenaState;
use crate::trace::TraceStartWhy;
use std::time::{Duration, Instant};

// Assumed tracing rate used to judge whether a world collection fits in
// an idle-time budget, in bytes per second.
const TRACE_RATE: f64 = 512.0 * 1024.0 * 1024.0;

impl ArenaState {
    /// Should the mutator's poll do anything at all? Polling starts
    /// once committed memory has grown past the poll threshold, so
    /// collection effort follows memory demand.
    pub(crate) fn policy_should_poll(&self) -> bool {
        !self.busy_traces.is_empty()
            || self.tracts.committed() as f64 >= self.poll_threshold
    }

    /// Keep polling while there is work and the quantum has not run
    /// out.
    pub(crate) fn policy_poll_again(&self, start: Instant, more_work: bool, _work: usize) -> bool {
        more_work && start.elapsed() < Duration::from_millis(self.cfg.poll_quantum_ms)
    }

    /// Is collecting the whole world worthwhile within an idle-time
    /// budget? Only when something is collectable, the budget covers
    /// the estimated work, and the last world collection is not too
    /// recent.
    pub(crate) fn policy_should_collect_world(&self, available: Duration, now: Instant) -> bool {
        let collectable: usize = self
            .pool_ring
            .iter()
            .filter(|p| self.pool_has_gc(**p))
            .map(|p| self.pool_total_size(*p))
            .sum();
        if collectable == 0 {
            return false;
        }
        let estimated = Duration::from_secs_f64(collectable as f64 / TRACE_RATE);
        now.duration_since(self.last_world_collect)
            >= Duration::from_millis(self.cfg.world_collect_min_ms)
            && available >= estimated
    }

    /// Should a trace start now? Only when new allocation on collected
    /// pools has outgrown the nursery of the default chain.
    pub(crate) fn policy_start_trace(&self, allow_world: bool) -> Option<TraceStartWhy> {
        if !allow_world {
            return None;
        }
        let chain = self.chains.get(self.default_chain?.0);
        if chain.new_size > chain.gens[0].capacity {
            Some(TraceStartWhy::Chain)
        } else {
            None
        }
    }

    /// Re-arm the poll threshold after a poll: leave the mutator alone
    /// until committed memory has grown by another interval.
    pub(crate) fn policy_rearm_poll(&mut self) {
        self.poll_threshold = self.tracts.committed() as f64 + self.cfg.poll_every as f64;
    }
}
