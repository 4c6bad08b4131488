//! A memory management arena hosting multiple coexisting pools.
//!
//! An [`Arena`] is one reservation of address space plus the control
//! plane that manages it: a tract table at page grain, segments carved
//! out of it by pools, and the colour, summary and shielding state that
//! incremental tracing needs. Several arenas can coexist in a process;
//! a global registry dispatches access faults to the owning arena and
//! supports a fork-safe claim/release protocol over every lock.
//!
//! ## Creating an arena and a pool
//!
//! ```rust
//! use quarry::{Arena, ArenaConfig};
//!
//! let arena = Arena::create(ArenaConfig::with_size(4 * 1024 * 1024)).unwrap();
//! let pool = arena.pool_create_manual(16).unwrap();
//!
//! let obj = arena.pool_alloc(pool, 64).unwrap();
//! assert!(arena.has_addr(obj));
//! arena.pool_free(pool, obj, 64);
//!
//! arena.pool_destroy(pool);
//! arena.destroy();
//! ```
//!
//! ## Allocation points
//!
//! Pools hand out memory through buffers: two-phase allocation points
//! that carve one segment at a time.
//!
//! ```rust
//! use quarry::{Arena, ArenaConfig, Rank};
//!
//! let arena = Arena::create(ArenaConfig::with_size(4 * 1024 * 1024)).unwrap();
//! let pool = arena.pool_create_manual(16).unwrap();
//! let ap = arena.buffer_create(pool, Rank::Exact).unwrap();
//!
//! let obj = arena.reserve(ap, 48).unwrap();
//! // ... initialize the object ...
//! assert!(arena.commit(ap, obj, 48));
//!
//! arena.buffer_destroy(ap);
//! arena.pool_destroy(pool);
//! arena.destroy();
//! ```
//!
//! ## Collection
//!
//! Tracing runs incrementally on mutator time: allocation slow paths
//! call [`Arena::poll`], and idle time can be donated with
//! [`Arena::step`]. Segments participate through their colour and
//! shield state; the read and write barriers are maintained by the
//! segment operations themselves.

mod arena;
mod buffer;
mod chain;
mod config;
mod describe;
mod global;
mod lock;
mod message;
mod metrics;
mod policy;
mod pool;
mod res;
mod root;
mod seg;
mod set;
mod shield;
mod slab;
mod trace;
mod tract;

pub use arena::Arena;
pub use buffer::BufId;
pub use chain::{ChainId, GenParam};
pub use config::ArenaConfig;
pub use global::{arena_access, claim_all, reinitialize_all, release_all};
pub use message::{Message, MessageType};
pub use metrics::ArenaMetrics;
pub use pool::PoolId;
pub use res::{Res, ResErr};
pub use root::{FormatId, RootId};
pub use seg::{SegClass, SegId};
pub use set::{AccessSet, Rank, RankSet, RefSet, TraceId, TraceSet, TRACE_MAX};
pub use trace::{TraceStartWhy, TraceState};
pub use tract::{Addr, SegPref};
