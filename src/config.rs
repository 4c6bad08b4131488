#[derive(Copy, Clone, Debug)]
pub struct ArenaConfig {
    // The size of the arena's address reservation in bytes. Rounded up
    // to a whole number of grains.
    pub size: usize,
    // The grain size: every tract, segment base and segment size is a
    // multiple of this. Must be a power of two of at least 4096.
    pub grain: usize,
    // Committed bytes may not exceed this. Allocation past the limit
    // fails with a commit-limit error rather than growing the arena.
    pub commit_limit: usize,
    // Whether segment placement honours zone preferences.
    pub zoned: bool,

    // The maximum amount of milliseconds one poll will steal from the
    // mutator before handing control back.
    pub poll_quantum_ms: u64,
    // How many bytes of committed growth are allowed between polls.
    pub poll_every: usize,
    // The amount of tracing work (in bytes scanned) one trace advance
    // performs before returning to the driver.
    pub trace_quantum: usize,
    // The minimum interval between two whole-world collections started
    // opportunistically from idle time.
    pub world_collect_min_ms: u64,

    // Default chain: nursery and mature generation capacities in bytes.
    // A trace is started once new allocation on collected pools
    // outgrows the nursery capacity.
    pub gen0_capacity: usize,
    pub gen1_capacity: usize,
}

impl ArenaConfig {
    pub fn default() -> Self {
        ArenaConfig {
            size: 64 * 1024 * 1024,
            grain: 4096,
            commit_limit: usize::MAX,
            zoned: true,
            poll_quantum_ms: 10,
            poll_every: 256 * 1024,
            trace_quantum: 512 * 1024,
            world_collect_min_ms: 1_000,
            gen0_capacity: 2 * 1024 * 1024,
            gen1_capacity: 8 * 1024 * 1024,
        }
    }

    pub fn with_size(size: usize) -> Self {
        ArenaConfig {
            size,
            ..Self::default()
        }
    }
}
