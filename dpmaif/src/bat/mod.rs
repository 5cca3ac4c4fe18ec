//! Buffer pool manager.
//!
//! Each downlink queue owns two pools: normal receive buffers (BAT) and
//! fragment buffers (FRG) for packets larger than one normal buffer.
//! Both use [`BatPool`]; only geometry differs.

pub mod pool;

pub use pool::{BatPool, PoolConfig};
