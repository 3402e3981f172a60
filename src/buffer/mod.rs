//! Buffer pool: a fixed-size page cache with pin counts, per-frame RWSX
//! latches, and QDLP eviction (probation / protected queues plus a ghost
//! list of recently evicted pages).

mod frame;
mod pool;
mod qdlp;

pub use frame::{Frame, PageBuffer, QueueKind};
pub use pool::{BufferPool, PageGuard, PoolStats};
