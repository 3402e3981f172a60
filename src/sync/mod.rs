//! Concurrency primitives: the RWSX latch and the lock-free index
//! structures used by the buffer pool.

mod map;
mod ring;
mod rwsx;

pub use map::AtomicU32Map;
pub use ring::{IndexRing, NONE_SLOT};
pub use rwsx::{LatchMode, RwsxLatch};
