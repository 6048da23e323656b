//! Fixed-size fragment buffers and the pool that recycles them.

pub mod fragment;
pub mod fragment_pool;

pub use fragment::Fragment;
pub use fragment_pool::{FragmentPool, PoolStats};
