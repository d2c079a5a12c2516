//! # masskv - In-Memory Transactional Key-Value Engine
//!
//! masskv is an in-memory, NUMA-aware transactional key-value engine. Its
//! primary index is a Masstree: a trie of B⁺-trees indexed on fixed-width
//! 64-bit key slices, supporting arbitrary-length binary keys. This Rust
//! implementation prioritizes:
//!
//! - **Latch-free reads**: traversal never blocks; readers validate page
//!   version snapshots hand-over-hand and retry on interference
//! - **Optimistic writes**: logical writes append redo logs and install at
//!   commit after read-set validation
//! - **NUMA locality**: page frames come from per-node pools; workers grab
//!   from core-local free lists
//!
//! ## Quick Start
//!
//! ```ignore
//! use masskv::{Engine, EngineOptions};
//!
//! let engine = Engine::new(EngineOptions::default())?;
//! engine.initialize()?;
//!
//! let mut ctx = engine.attach_thread(0)?;
//! let tree = engine.storage_manager().create_masstree(&mut ctx, "kv")?;
//!
//! engine.begin_xct(&mut ctx)?;
//! tree.insert_record(&mut ctx, b"key", b"value")?;
//! engine.precommit_xct(&mut ctx)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        Engine (init/teardown)        │
//! ├──────────────────────────────────────┤
//! │ StorageManager │ XctManager (OCC)    │
//! ├────────────────┼─────────────────────┤
//! │ Masstree Index │ Array Storage       │
//! ├──────────────────────────────────────┤
//! │  Page Version Protocol (lock-free)   │
//! ├──────────────────────────────────────┤
//! │  Volatile Page Pool (per NUMA node)  │
//! └──────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Contract
//!
//! Every record slot carries an 8-byte `XctId`; every page carries a 64-bit
//! version word. Readers observe, copy, and re-validate; structural writers
//! spin-lock single pages and publish with release stores. Transactions
//! collect read/write/pointer sets and validate them at precommit; a loser
//! of a conflict gets `XctRaceAbort` and simply reruns.
//!
//! ## Module Overview
//!
//! - [`engine`]: component owner, init/teardown, worker attachment
//! - [`storage`]: storage catalog, masstree and array indexes, page words
//! - [`xct`]: XctId, transaction sets, optimistic read, commit protocol
//! - [`memory`]: NUMA-partitioned page pool and resolvers
//! - [`thread`]: per-worker context (free-page cache, xct, log buffer)
//! - [`config`]: geometry constants and engine options

pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod storage;
pub mod thread;
pub mod xct;

pub use config::EngineOptions;
pub use engine::Engine;
pub use error::{ErrorCode, StorageResult};
pub use storage::{Storage, StorageType};
pub use thread::ThreadContext;
