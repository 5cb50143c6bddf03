//! I/O utilities for tun-relay
//!
//! # Buffer Pool
//!
//! [`BufferPool`] hands out fixed-size scratch buffers for the relay loops
//! and the UDP envelope path.
//!
//! # Copy
//!
//! [`copy_with_deadline`] drives one direction of a TCP relay, bounding
//! every individual read and write by a timeout.

mod buffer_pool;
mod copy;

pub use buffer_pool::{
    BufferPool, BufferPoolStats, BufferPoolStatsSnapshot, PooledBuffer, DEFAULT_BUFFER_SIZE,
    DEFAULT_POOL_CAPACITY,
};
pub use copy::{copy_with_deadline, CopyEnd, CopyResult};
