//! # Optimistic Concurrency Control
//!
//! Records never carry pessimistic locks for logical access. Instead every
//! record slot owns an 8-byte [`XctId`] version word; readers observe it,
//! copy data, and re-validate, while writers defer all mutation to commit.
//! The transaction accumulates three collections that commit-time
//! validation replays:
//!
//! - **read set** — `(storage, owner address, observed id)` per logical read
//! - **write set** — `(storage, owner address, record address, log handle)`
//!   per logical write
//! - **pointer set** — `(root pointer address, observed word)` per root
//!   pointer the traversal relied on
//!
//! ## XctId Word Layout (8 bytes)
//!
//! ```text
//! Bits    Field     Notes
//! ------  --------  -------------------------------------------
//! 63..32  epoch     coarse logical time, managed by the manager
//! 31..8   ordinal   serialization order within the epoch
//! 7..0    flags     bit0 deleted, bit1 keylocked, bit2 moved
//! ```
//!
//! A slot's id only grows (epoch, ordinal) over its lifetime. `deleted`
//! marks a logically absent record that still occupies its physical slot;
//! `moved` marks a record whose bytes were relocated by a foster split and
//! whose old slot must no longer be trusted; `keylocked` is the short
//! commit-time lock.

mod log_buffer;
mod manager;

pub use log_buffer::{
    calculate_log_length, LogBuffer, LogEntry, LogEntryHeader, LogType, LOG_HEADER_SIZE,
};
pub use manager::{Epoch, XctManager};

use std::sync::atomic::{fence, AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::error::{ErrorCode, StorageResult};
use crate::storage::StorageId;

const DELETED: u64 = 1 << 0;
const KEYLOCKED: u64 = 1 << 1;
const MOVED: u64 = 1 << 2;

const ORDINAL_SHIFT: u32 = 8;
const ORDINAL_MASK: u64 = 0xFF_FFFF << ORDINAL_SHIFT;
const ORDINAL_MAX: u32 = 0xFF_FFFF;
const EPOCH_SHIFT: u32 = 32;

/// A record's 8-byte owner/version word, as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct XctId(pub u64);

impl XctId {
    pub fn new(epoch: u32, ordinal: u32) -> Self {
        debug_assert!(ordinal <= ORDINAL_MAX);
        Self(((epoch as u64) << EPOCH_SHIFT) | ((ordinal as u64) << ORDINAL_SHIFT))
    }

    pub fn epoch(self) -> u32 {
        (self.0 >> EPOCH_SHIFT) as u32
    }

    pub fn ordinal(self) -> u32 {
        ((self.0 & ORDINAL_MASK) >> ORDINAL_SHIFT) as u32
    }

    pub fn is_deleted(self) -> bool {
        self.0 & DELETED != 0
    }

    pub fn is_keylocked(self) -> bool {
        self.0 & KEYLOCKED != 0
    }

    pub fn is_moved(self) -> bool {
        self.0 & MOVED != 0
    }

    pub fn with_deleted(self, on: bool) -> Self {
        if on {
            Self(self.0 | DELETED)
        } else {
            Self(self.0 & !DELETED)
        }
    }

    pub fn with_moved(self) -> Self {
        Self(self.0 | MOVED)
    }

    fn with_keylock(self) -> Self {
        Self(self.0 | KEYLOCKED)
    }

    fn without_keylock(self) -> Self {
        Self(self.0 & !KEYLOCKED)
    }

    /// Epoch, ordinal and logical flags; everything except the transient
    /// keylock bit. Read validation compares this.
    pub fn xct_info(self) -> u64 {
        self.0 & !KEYLOCKED
    }

    /// The next ordinal, wrapping into the following epoch on saturation.
    /// Used by system transactions that must publish "something changed"
    /// without claiming a serialization point.
    pub fn advanced(self) -> Self {
        let ordinal = self.ordinal();
        if ordinal < ORDINAL_MAX {
            Self((self.0 & !ORDINAL_MASK) | (((ordinal + 1) as u64) << ORDINAL_SHIFT))
        } else {
            Self::new(self.epoch().wrapping_add(1), 0)
                .with_deleted(self.is_deleted())
        }
    }
}

/// The atomic cell holding a record's [`XctId`].
#[repr(transparent)]
#[derive(Debug)]
pub struct AtomicXctId(AtomicU64);

impl AtomicXctId {
    pub fn new(id: XctId) -> Self {
        Self(AtomicU64::new(id.0))
    }

    pub fn load_acquire(&self) -> XctId {
        XctId(self.0.load(Ordering::Acquire))
    }

    /// Stores a fully formed id. Release-ordered so record bytes written
    /// before it are published with it.
    pub fn store_release(&self, id: XctId) {
        self.0.store(id.0, Ordering::Release);
    }

    /// Spin-acquires the keylock. Returns the id as observed when the lock
    /// was won (with the keylock bit set).
    pub fn keylock_unconditional(&self) -> XctId {
        loop {
            let cur = XctId(self.0.load(Ordering::Relaxed));
            if !cur.is_keylocked()
                && self
                    .0
                    .compare_exchange_weak(
                        cur.0,
                        cur.with_keylock().0,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                return cur.with_keylock();
            }
            std::hint::spin_loop();
        }
    }

    /// Releases the keylock, publishing `new` (which must not carry the
    /// keylock bit).
    pub fn release_keylock_with(&self, new: XctId) {
        debug_assert!(!new.is_keylocked());
        debug_assert!(self.load_acquire().is_keylocked());
        self.0.store(new.0, Ordering::Release);
    }
}

/// One read-set observation.
pub struct ReadEntry {
    pub storage: StorageId,
    pub owner: *const AtomicXctId,
    pub observed: XctId,
}

/// One deferred write.
pub struct WriteEntry {
    pub storage: StorageId,
    pub owner: *const AtomicXctId,
    pub record: *mut u8,
    pub log_ptr: *const u8,
    pub log_len: usize,
}

/// One root-pointer observation.
pub struct PointerEntry {
    pub addr: *const AtomicU64,
    pub observed: u64,
}

/// The per-worker transaction state. Owned by exactly one thread; the raw
/// addresses inside point at page frames that outlive every transaction.
pub struct Xct {
    active: bool,
    read_set: SmallVec<[ReadEntry; 16]>,
    write_set: SmallVec<[WriteEntry; 16]>,
    pointer_set: SmallVec<[PointerEntry; 8]>,
}

impl Xct {
    pub fn new() -> Self {
        Self {
            active: false,
            read_set: SmallVec::new(),
            write_set: SmallVec::new(),
            pointer_set: SmallVec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn activate(&mut self) {
        debug_assert!(!self.active, "transaction already running");
        self.active = true;
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.read_set.clear();
        self.write_set.clear();
        self.pointer_set.clear();
    }

    pub fn read_set(&self) -> &[ReadEntry] {
        &self.read_set
    }

    pub fn write_set(&self) -> &[WriteEntry] {
        &self.write_set
    }

    pub fn pointer_set(&self) -> &[PointerEntry] {
        &self.pointer_set
    }

    pub fn add_to_read_set(
        &mut self,
        storage: StorageId,
        owner: *const AtomicXctId,
        observed: XctId,
    ) {
        debug_assert!(self.active);
        self.read_set.push(ReadEntry {
            storage,
            owner,
            observed,
        });
    }

    pub fn add_to_write_set(
        &mut self,
        storage: StorageId,
        owner: *const AtomicXctId,
        record: *mut u8,
        log_ptr: *const u8,
        log_len: usize,
    ) {
        debug_assert!(self.active);
        self.write_set.push(WriteEntry {
            storage,
            owner,
            record,
            log_ptr,
            log_len,
        });
    }

    /// Records a root-pointer observation. The first observation of an
    /// address wins; later sightings of the same pointer are no-ops.
    pub fn add_to_pointer_set(&mut self, addr: *const AtomicU64, observed: u64) {
        debug_assert!(self.active);
        if self.pointer_set.iter().any(|e| e.addr == addr) {
            return;
        }
        self.pointer_set.push(PointerEntry { addr, observed });
    }

    /// Replaces the observation for `addr`. Root growth installs a new root
    /// from inside the running transaction and must not abort itself over
    /// its own swap.
    pub fn overwrite_to_pointer_set(&mut self, addr: *const AtomicU64, observed: u64) {
        debug_assert!(self.active);
        for entry in self.pointer_set.iter_mut() {
            if entry.addr == addr {
                entry.observed = observed;
                return;
            }
        }
        self.pointer_set.push(PointerEntry { addr, observed });
    }
}

impl Default for Xct {
    fn default() -> Self {
        Self::new()
    }
}

/// The optimistic-read protocol.
///
/// Loops until `reader` runs against a stable owner id: observe the id
/// (spinning past the keylock), let `reader` copy or validate data, then
/// re-read. On success the observation joins the read set. `reader` must be
/// side-effect-free across retries and capture only by reference.
///
/// A `moved` observation means a foster split relocated the record; the
/// caller restarts from the root to find the live copy.
pub fn optimistic_read<F>(
    xct: &mut Xct,
    storage: StorageId,
    owner: &AtomicXctId,
    mut reader: F,
) -> StorageResult<()>
where
    F: FnMut(XctId) -> StorageResult<()>,
{
    let mut retries = 0usize;
    loop {
        let observed = owner.load_acquire();
        if observed.is_keylocked() {
            std::hint::spin_loop();
            continue;
        }
        if observed.is_moved() {
            return Err(ErrorCode::MasstreeRetry);
        }
        reader(observed)?;
        fence(Ordering::Acquire);
        if owner.load_acquire() == observed {
            xct.add_to_read_set(storage, owner as *const AtomicXctId, observed);
            return Ok(());
        }
        retries += 1;
        if retries == crate::config::MAX_RETRIES {
            tracing::warn!(retries, "optimistic read keeps losing to a writer");
        }
    }
}
