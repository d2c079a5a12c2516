//! # Engine
//!
//! The component owner: one `Engine` holds the NUMA-partitioned page pool,
//! the storage catalog, and the transaction manager. Construction allocates
//! the pools; `initialize`/`uninitialize` bracket the window in which
//! workers may attach and operate. Outside the window every entry point
//! answers `NotInitialized`.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = Engine::new(EngineOptions::default())?;
//! engine.initialize()?;
//!
//! let mut ctx = engine.attach_thread(0)?;
//! let tree = engine.storage_manager().create_masstree(&mut ctx, "accounts")?;
//!
//! engine.begin_xct(&mut ctx)?;
//! tree.insert_record(&mut ctx, b"alice", b"100")?;
//! engine.precommit_xct(&mut ctx)?;
//!
//! engine.uninitialize()?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result};

use crate::config::EngineOptions;
use crate::error::{ErrorCode, StorageResult};
use crate::memory::{CoreMemory, PagePool, PageResolver};
use crate::storage::StorageManager;
use crate::thread::ThreadContext;
use crate::xct::{Epoch, XctManager};

pub struct Engine {
    options: EngineOptions,
    resolver: PageResolver,
    storage_manager: StorageManager,
    xct_manager: XctManager,
    initialized: AtomicBool,
}

impl Engine {
    /// Allocates the page pools and assembles the components. The engine
    /// stays inert until [`initialize`](Self::initialize).
    pub fn new(options: EngineOptions) -> Result<Self> {
        ensure!(
            (1..=255).contains(&options.numa_nodes),
            "numa_nodes must be in 1..=255, got {}",
            options.numa_nodes
        );
        ensure!(
            options.pages_per_node >= 16,
            "pages_per_node too small to hold any tree: {}",
            options.pages_per_node
        );
        let pools: Vec<PagePool> = (0..options.numa_nodes)
            .map(|node| PagePool::new(node as u8, options.pages_per_node))
            .collect();
        let resolver = PageResolver::new(Arc::new(pools));
        Ok(Self {
            options,
            resolver,
            storage_manager: StorageManager::new(),
            xct_manager: XctManager::new(),
            initialized: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn initialize(&self) -> Result<()> {
        if self.initialized.swap(true, Ordering::AcqRel) {
            bail!("engine initialized twice");
        }
        tracing::info!(
            nodes = self.options.numa_nodes,
            pages_per_node = self.options.pages_per_node,
            "engine initialized"
        );
        Ok(())
    }

    /// Tears the engine down: drops every storage and rejects further
    /// operations. Callers guarantee all workers are quiescent.
    pub fn uninitialize(&self) -> Result<()> {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            bail!("engine is not initialized");
        }
        self.storage_manager.drop_all();
        tracing::info!("engine uninitialized");
        Ok(())
    }

    pub fn storage_manager(&self) -> &StorageManager {
        &self.storage_manager
    }

    pub fn xct_manager(&self) -> &XctManager {
        &self.xct_manager
    }

    pub fn resolver(&self) -> &PageResolver {
        &self.resolver
    }

    /// Creates a worker context bound to `node`'s page pool.
    pub fn attach_thread(&self, node: u8) -> StorageResult<ThreadContext> {
        if !self.is_initialized() {
            return Err(ErrorCode::NotInitialized);
        }
        if node as usize >= self.options.numa_nodes {
            return Err(ErrorCode::NotInitialized);
        }
        Ok(ThreadContext::new(CoreMemory::new(
            node,
            self.resolver.clone(),
        )))
    }

    pub fn begin_xct(&self, context: &mut ThreadContext) -> StorageResult<()> {
        if !self.is_initialized() {
            return Err(ErrorCode::NotInitialized);
        }
        self.xct_manager.begin_xct(&mut context.xct)
    }

    pub fn precommit_xct(&self, context: &mut ThreadContext) -> StorageResult<Epoch> {
        self.xct_manager
            .precommit_xct(&mut context.xct, &mut context.log)
    }

    pub fn abort_xct(&self, context: &mut ThreadContext) {
        self.xct_manager.abort_xct(&mut context.xct, &mut context.log);
    }
}
