//! Volatile memory management: the NUMA-partitioned page pool, the
//! offset-to-address resolver, and the per-worker free-page cache.

mod page_pool;

pub use page_pool::{CoreMemory, PageFrame, PagePool, PageResolver};
