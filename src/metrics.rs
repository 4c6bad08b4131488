/// A snapshot of the arena's accounting and collection counters. Can be
/// acquired by calling `arena.metrics()`.
#[derive(Debug, Clone)]
pub struct ArenaMetrics {
    pub reserved: usize,
    pub committed: usize,
    pub commit_limit: usize,

    // Running count of collections begun, and the trace table load.
    pub collections: usize,
    pub busy_traces: usize,
    pub flipped_traces: usize,

    // Mutator allocation accounting, in bytes. fill - empty >= alloc
    // at all times; all three only ever grow.
    pub fill_mutator_size: f64,
    pub empty_mutator_size: f64,
    pub alloc_mutator_size: f64,
    pub fill_internal_size: f64,
    pub empty_internal_size: f64,

    // Total tracing effort, in bytes scanned and seconds spent.
    pub traced_work: f64,
    pub traced_time: f64,

    pub write_barrier_hits: u64,
    pub access_faults: u64,
    pub dropped_messages: u64,
    pub epoch: u64,
}
