//! # Transaction Manager
//!
//! Coordinates begin/precommit/abort for the optimistic protocol. The
//! commit sequence is the classic verify-then-install pipeline:
//!
//! ```text
//! 1. keylock every write-set owner, in address order (no deadlock)
//! 2. verify the read set: each observed XctId is unchanged and not
//!    keylocked by another transaction
//! 3. verify the pointer set: each root pointer word still holds the
//!    observed value
//! 4. derive the commit XctId: current epoch, ordinal above every id the
//!    transaction saw or locked
//! 5. apply redo logs to the records, then store the commit id into each
//!    owner (the store doubles as keylock release)
//! ```
//!
//! Any verification failure releases the keylocks untouched and aborts the
//! transaction; the caller sees `XctRaceAbort` and may simply run the
//! transaction again.
//!
//! Epochs are a coarse logical clock. This in-memory engine advances them
//! on demand; there is no durability boundary attached, so
//! [`XctManager::wait_for_commit`] returns immediately.

use std::sync::atomic::{fence, AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::error::{ErrorCode, StorageResult};
use crate::xct::{AtomicXctId, LogBuffer, LogEntry, LogType, Xct, XctId};

pub type Epoch = u32;

const ORDINAL_MAX: u32 = 0xFF_FFFF;

pub struct XctManager {
    global_epoch: AtomicU32,
}

impl XctManager {
    pub fn new() -> Self {
        Self {
            global_epoch: AtomicU32::new(1),
        }
    }

    pub fn current_epoch(&self) -> Epoch {
        self.global_epoch.load(Ordering::Acquire)
    }

    pub fn advance_epoch(&self) -> Epoch {
        self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn begin_xct(&self, xct: &mut Xct) -> StorageResult<()> {
        if xct.is_active() {
            // Nested begins are a caller bug; treat the old one as aborted.
            xct.deactivate();
        }
        xct.activate();
        Ok(())
    }

    pub fn abort_xct(&self, xct: &mut Xct, log: &mut LogBuffer) {
        xct.deactivate();
        log.reset();
    }

    /// Validates and installs the transaction. On success returns the commit
    /// epoch; on a conflict the transaction is aborted and `XctRaceAbort`
    /// is returned.
    pub fn precommit_xct(&self, xct: &mut Xct, log: &mut LogBuffer) -> StorageResult<Epoch> {
        if !xct.is_active() {
            return Err(ErrorCode::NotInitialized);
        }

        // Lock every distinct owner in address order.
        let mut owners: SmallVec<[*const AtomicXctId; 16]> =
            xct.write_set().iter().map(|w| w.owner).collect();
        owners.sort_unstable();
        owners.dedup();

        let mut locked: SmallVec<[(*const AtomicXctId, XctId); 16]> = SmallVec::new();
        for &owner_ptr in owners.iter() {
            // SAFETY: write-set owner addresses point into page frames that
            // live until engine teardown.
            let owner = unsafe { &*owner_ptr };
            let observed = owner.keylock_unconditional();
            if observed.is_moved() {
                // A foster split relocated the record after we logged the
                // write; the old slot can no longer be installed into.
                Self::release_locked(&locked, None);
                owner.release_keylock_with(XctId(observed.xct_info()));
                self.fail(xct, log);
                return Err(ErrorCode::XctRaceAbort);
            }
            locked.push((owner_ptr, observed));
        }

        fence(Ordering::AcqRel);

        // Read-set verification.
        let reads_valid = xct.read_set().iter().all(|entry| {
            // SAFETY: as above; read-set owners outlive the transaction.
            let owner = unsafe { &*entry.owner };
            let current = owner.load_acquire();
            current.xct_info() == entry.observed.xct_info()
                && (!current.is_keylocked() || owners.binary_search(&entry.owner).is_ok())
        });
        // Pointer-set verification: a swapped root pointer means the pages
        // this transaction descended through may no longer be reachable.
        let pointers_valid = xct.pointer_set().iter().all(|entry| {
            // SAFETY: pointer-set addresses are root pointer words inside
            // storages or page frames, both alive until teardown.
            let current = unsafe { (*entry.addr).load(Ordering::Acquire) };
            current == entry.observed
        });
        if !reads_valid || !pointers_valid {
            Self::release_locked(&locked, None);
            self.fail(xct, log);
            return Err(ErrorCode::XctRaceAbort);
        }

        let epoch = self.current_epoch();
        let commit_id = self.derive_commit_id(xct, &locked, epoch);

        // Apply redo logs in issue order, tracking the final logical state
        // per owner (a delete after an insert leaves the record deleted).
        let mut final_deleted: SmallVec<[(*const AtomicXctId, bool); 16]> =
            owners.iter().map(|&o| (o, false)).collect();
        for write in xct.write_set() {
            // SAFETY: the log handle was produced by this thread's log
            // buffer and stays valid until the reset below.
            let entry = unsafe { LogEntry::from_raw(write.log_ptr, write.log_len) };
            let header = entry.header();
            let deleted = match header.log_type() {
                LogType::MasstreeDelete => true,
                LogType::MasstreeInsert
                | LogType::MasstreeOverwrite
                | LogType::ArrayOverwrite => {
                    let payload = entry.payload();
                    // SAFETY: the record address points at a payload region
                    // of at least offset+count bytes inside a live page
                    // frame; the keylock on its owner excludes concurrent
                    // installers, and optimistic readers re-validate the
                    // owner id after copying.
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            payload.as_ptr(),
                            write.record.add(header.payload_offset()),
                            payload.len(),
                        );
                    }
                    false
                }
                LogType::Unknown => false,
            };
            if let Ok(pos) = final_deleted.binary_search_by_key(&write.owner, |e| e.0) {
                final_deleted[pos].1 = deleted;
            }
        }

        Self::release_locked(&locked, Some((commit_id, &final_deleted)));

        xct.deactivate();
        log.reset();
        Ok(epoch)
    }

    fn fail(&self, xct: &mut Xct, log: &mut LogBuffer) {
        xct.deactivate();
        log.reset();
    }

    /// Unlocks every keylocked owner. With an install payload, stores the
    /// commit id (plus per-owner deleted flag); otherwise restores the
    /// pre-lock value.
    fn release_locked(
        locked: &[(*const AtomicXctId, XctId)],
        install: Option<(XctId, &[(*const AtomicXctId, bool)])>,
    ) {
        for &(owner_ptr, observed) in locked {
            // SAFETY: owners outlive the transaction; we hold their keylock.
            let owner = unsafe { &*owner_ptr };
            match install {
                Some((commit_id, flags)) => {
                    let deleted = flags
                        .binary_search_by_key(&owner_ptr, |e| e.0)
                        .map(|pos| flags[pos].1)
                        .unwrap_or(false);
                    owner.release_keylock_with(commit_id.with_deleted(deleted));
                }
                None => {
                    owner.release_keylock_with(XctId(observed.xct_info()));
                }
            }
        }
    }

    fn derive_commit_id(
        &self,
        xct: &Xct,
        locked: &[(*const AtomicXctId, XctId)],
        epoch: Epoch,
    ) -> XctId {
        let mut max_ordinal = 0u32;
        for &(_, observed) in locked {
            if observed.epoch() == epoch {
                max_ordinal = max_ordinal.max(observed.ordinal());
            }
        }
        for entry in xct.read_set() {
            if entry.observed.epoch() == epoch {
                max_ordinal = max_ordinal.max(entry.observed.ordinal());
            }
        }
        if max_ordinal >= ORDINAL_MAX {
            let epoch = self.advance_epoch();
            return XctId::new(epoch, 1);
        }
        XctId::new(epoch, max_ordinal + 1)
    }

    /// In-memory engine: commits are visible the moment precommit returns.
    pub fn wait_for_commit(&self, _epoch: Epoch) -> StorageResult<()> {
        Ok(())
    }
}

impl Default for XctManager {
    fn default() -> Self {
        Self::new()
    }
}
