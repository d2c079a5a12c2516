//! Configuration constants and engine options.

mod constants;

pub use constants::*;

/// Sizing knobs for [`crate::engine::Engine`] construction.
///
/// The defaults are small enough for tests while leaving room for a few
/// thousand pages of tree growth per node.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Number of NUMA nodes to partition the volatile page pool across.
    pub numa_nodes: usize,
    /// Number of page frames per node pool.
    pub pages_per_node: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            numa_nodes: 1,
            pages_per_node: 16 * 1024,
        }
    }
}

impl EngineOptions {
    /// A deliberately small configuration for unit tests.
    pub fn tiny() -> Self {
        Self {
            numa_nodes: 1,
            pages_per_node: 1024,
        }
    }
}
