//! # Worker Thread Context
//!
//! Every worker owns one [`ThreadContext`]: its NUMA-local free-page cache,
//! its transaction state, and its redo log buffer. The storage core never
//! touches global state directly; everything flows through this handle.
//!
//! A context is created from the engine (pinning it to a node pool) and
//! stays on its thread; none of its parts are shared.

use crate::memory::{CoreMemory, PageResolver};
use crate::xct::{LogBuffer, Xct};

pub struct ThreadContext {
    /// NUMA-local page grab/release cache.
    pub core: CoreMemory,
    /// The (at most one) transaction this worker is running.
    pub xct: Xct,
    /// Redo log arena for the running transaction.
    pub log: LogBuffer,
}

impl ThreadContext {
    pub fn new(core: CoreMemory) -> Self {
        Self {
            core,
            xct: Xct::new(),
            log: LogBuffer::new(),
        }
    }

    pub fn node(&self) -> u8 {
        self.core.node()
    }

    pub fn resolver(&self) -> &PageResolver {
        self.core.resolver()
    }
}
