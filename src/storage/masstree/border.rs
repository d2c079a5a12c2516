//! # Border (Leaf) Page
//!
//! A border page is a slot table plus a cell region sharing one 4KB frame:
//!
//! ```text
//! +--------------------------+
//! | Page Header (64B)        |  version word, fences, foster link
//! +--------------------------+
//! | cell watermark (8B)      |  low edge of the used cell region
//! +--------------------------+
//! | Slot Table               |  BORDER_MAX_KEYS fixed slots, grows forward
//! | [Slot 0] [Slot 1] ...    |  owner XctId | slice | packed info
//! +--------------------------+
//! | Free Space               |
//! +--------------------------+
//! | Cell Region              |  grows backward from the page end
//! | (suffix | payload)       |
//! +--------------------------+
//! ```
//!
//! ## Slot (24 bytes)
//!
//! - **owner id**: the record's 8-byte `XctId`; the OCC observation point.
//! - **slice**: the key's 8-byte slice within this layer.
//! - **info**: packed `remaining_key_length | payload_length | cell_offset |
//!   payload_capacity`. A remaining length of `NEXT_LAYER_SENTINEL` marks a
//!   next-layer pointer slot whose payload region holds a
//!   [`DualPagePointer`] instead of record bytes.
//!
//! ## Cell Layout
//!
//! `[suffix (8-aligned)] [payload (8-aligned, >= 16 bytes)]`. The payload
//! region is reserved at `max(payload, 16)` so a record slot can be promoted
//! to a next-layer pointer in place. Suffix bytes are written once when the
//! slot is reserved and never change, so they are read without validation;
//! payload bytes change only under the owner's keylock and readers
//! re-validate the owner id after copying.
//!
//! ## Ordering
//!
//! Slots are append-ordered, not sorted; searches scan the first
//! `key_count` slots linearly. A slot becomes visible in two release steps:
//! the slot words first, the incremented key count at page unlock.
//!
//! ## Split
//!
//! `split_foster` moves the upper half of the live records into a freshly
//! allocated right sibling and publishes it as this page's foster child.
//! Moved records leave their slot behind with the `moved` flag set in the
//! owner id; readers that still hold the old slot observe the flag and
//! restart from the root. Tombstoned slots are never reused, so a slot
//! address refers to one record for the page's whole lifetime.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::config::{
    BORDER_CELL_BYTES, BORDER_MAX_KEYS, MIN_PAYLOAD_RESERVATION, NEXT_LAYER_SENTINEL, PAGE_SIZE,
};
use crate::error::StorageResult;
use crate::memory::CoreMemory;
use crate::storage::masstree::{KeySlice, MasstreePage};
use crate::storage::{align8, DualPagePointer, PageType, StorageId, VolatilePointer};
use crate::xct::{AtomicXctId, XctId};

/// Packed per-slot metadata.
///
/// ```text
/// Bits     Field
/// ------   -----------------
/// 0..8     remaining_key_length (0xFF = next-layer pointer)
/// 8..24    payload_length
/// 24..40   cell_offset (into the cell region)
/// 40..56   payload_capacity
/// ```
#[derive(Debug, Clone, Copy)]
struct SlotInfo(u64);

impl SlotInfo {
    fn pack(remaining: u8, payload_length: usize, cell_offset: usize, capacity: usize) -> Self {
        debug_assert!(payload_length <= 0xFFFF && cell_offset <= 0xFFFF && capacity <= 0xFFFF);
        Self(
            remaining as u64
                | ((payload_length as u64) << 8)
                | ((cell_offset as u64) << 24)
                | ((capacity as u64) << 40),
        )
    }

    fn remaining(self) -> u8 {
        self.0 as u8
    }

    fn payload_length(self) -> usize {
        ((self.0 >> 8) & 0xFFFF) as usize
    }

    fn cell_offset(self) -> usize {
        ((self.0 >> 24) & 0xFFFF) as usize
    }

    fn payload_capacity(self) -> usize {
        ((self.0 >> 40) & 0xFFFF) as usize
    }
}

#[repr(C)]
struct BorderSlot {
    owner_id: AtomicXctId,
    slice: AtomicU64,
    info: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<BorderSlot>() == crate::config::BORDER_SLOT_BYTES);

/// Outcome of [`BorderPage::find_key_for_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindKeyForReserve {
    /// The same key already occupies this slot (possibly deleted).
    ExactMatchLocalRecord(usize),
    /// The matching slot is a next-layer pointer; descend.
    ExactMatchLayerPointer(usize),
    /// A record shares the slice but diverges in its suffix; promote it to
    /// a next layer.
    ConflictingLocalRecord(usize),
    /// The insert is safe here.
    NotFound,
}

#[repr(C)]
pub struct BorderPage {
    base: MasstreePage,
    /// Low edge of the used cell region; cells allocate downward from
    /// `BORDER_CELL_BYTES`. Mutated only under the page lock.
    cell_watermark: AtomicU32,
    _pad: u32,
    slots: [BorderSlot; BORDER_MAX_KEYS],
    cells: UnsafeCell<[u8; BORDER_CELL_BYTES]>,
}

const _: () = assert!(std::mem::size_of::<BorderPage>() == PAGE_SIZE);

// Cell bytes are raced deliberately: writes happen under the owner keylock
// or before slot publication, reads are validated by the owner id.
unsafe impl Sync for BorderPage {}

impl BorderPage {
    /// Initializes a frame as an empty border page and returns it.
    ///
    /// # Safety
    /// `frame` must be a pool frame exclusively owned by the caller.
    pub(crate) unsafe fn initialize<'a>(
        frame: *mut u8,
        storage_id: StorageId,
        page_id: VolatilePointer,
        layer: u8,
        root: bool,
        low_fence: KeySlice,
        high_fence: KeySlice,
        high_fence_supremum: bool,
        locked: bool,
    ) -> &'a BorderPage {
        MasstreePage::initialize(
            frame,
            PageType::MasstreeBorder,
            storage_id,
            page_id,
            layer,
            root,
            low_fence,
            high_fence,
            high_fence_supremum,
            locked,
        );
        let page = &*(frame as *const BorderPage);
        page.cell_watermark
            .store(BORDER_CELL_BYTES as u32, Ordering::Release);
        page
    }

    pub fn base(&self) -> &MasstreePage {
        &self.base
    }

    pub fn version(&self) -> &crate::storage::masstree::PageVersion {
        self.base.version()
    }

    pub fn layer(&self) -> u8 {
        self.base.layer()
    }

    pub fn within_fences(&self, slice: KeySlice) -> bool {
        self.base.within_fences(slice)
    }

    pub fn within_foster_child(&self, slice: KeySlice) -> bool {
        self.base.within_foster_child(slice)
    }

    fn slot(&self, index: usize) -> &BorderSlot {
        debug_assert!(index < BORDER_MAX_KEYS);
        &self.slots[index]
    }

    pub fn owner_id(&self, index: usize) -> &AtomicXctId {
        &self.slot(index).owner_id
    }

    fn info(&self, index: usize) -> SlotInfo {
        SlotInfo(self.slot(index).info.load(Ordering::Acquire))
    }

    pub fn slice(&self, index: usize) -> KeySlice {
        self.slot(index).slice.load(Ordering::Acquire)
    }

    pub fn does_point_to_layer(&self, index: usize) -> bool {
        self.info(index).remaining() == NEXT_LAYER_SENTINEL
    }

    pub fn remaining_key_length(&self, index: usize) -> u8 {
        self.info(index).remaining()
    }

    pub fn payload_length(&self, index: usize) -> usize {
        self.info(index).payload_length()
    }

    pub fn payload_capacity(&self, index: usize) -> usize {
        self.info(index).payload_capacity()
    }

    fn cells_base(&self) -> *mut u8 {
        self.cells.get() as *mut u8
    }

    fn suffix_bytes_of(remaining: u8) -> usize {
        if remaining == NEXT_LAYER_SENTINEL || remaining <= 8 {
            0
        } else {
            remaining as usize - 8
        }
    }

    /// Bytes a new record's cell needs in the cell region.
    pub fn required_cell_bytes(remaining: u8, payload_count: usize) -> usize {
        align8(Self::suffix_bytes_of(remaining))
            + align8(payload_count.max(MIN_PAYLOAD_RESERVATION))
    }

    /// Whether a record of this shape fits, given `count` already-used
    /// slots. Geometric only; the caller still races for the space until it
    /// holds the page lock.
    pub fn can_accommodate(&self, count: usize, remaining: u8, payload_count: usize) -> bool {
        if count >= BORDER_MAX_KEYS {
            return false;
        }
        let watermark = self.cell_watermark.load(Ordering::Acquire) as usize;
        Self::required_cell_bytes(remaining, payload_count) <= watermark
    }

    /// Address of the record's payload region. Stable for the slot's
    /// lifetime.
    pub fn payload_ptr(&self, index: usize) -> *mut u8 {
        let info = self.info(index);
        let suffix = align8(Self::suffix_bytes_of(info.remaining()));
        // SAFETY: cell_offset/suffix were computed inside the region when
        // the slot was reserved.
        unsafe { self.cells_base().add(info.cell_offset() + suffix) }
    }

    /// Copies `out.len()` payload bytes starting at `offset`. The caller
    /// validates the owner id around this per the optimistic protocol.
    pub fn copy_payload(&self, index: usize, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.payload_capacity(index));
        // SAFETY: in-bounds per the capacity check; concurrent writers hold
        // the owner keylock and the caller re-validates the owner id.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.payload_ptr(index).add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    /// The stored suffix bytes. Immutable after slot publication, so the
    /// borrow is safe without owner validation.
    pub fn suffix(&self, index: usize) -> &[u8] {
        let info = self.info(index);
        let len = Self::suffix_bytes_of(info.remaining());
        // SAFETY: suffix bytes were fully written before the slot became
        // visible and never change afterwards.
        unsafe { std::slice::from_raw_parts(self.cells_base().add(info.cell_offset()), len) }
    }

    /// Byte-compares the stored suffix. Suffix bytes are immutable after
    /// slot publication.
    pub fn suffix_matches(&self, index: usize, suffix: &[u8]) -> bool {
        self.suffix(index) == suffix
    }

    /// A slot that is both relocated and deleted carries no usable state:
    /// a retired undersized placeholder, or a tombstone whose copy went to
    /// a foster sibling. Searches skip them; the key's live state, if any,
    /// sits in a later slot or another page.
    fn is_defunct(&self, index: usize) -> bool {
        let owner = self.owner_id(index).load_acquire();
        owner.is_moved() && owner.is_deleted()
    }

    /// The next-layer pointer stored in the payload region.
    pub fn next_layer_pointer(&self, index: usize) -> &DualPagePointer {
        debug_assert!(self.does_point_to_layer(index));
        self.payload_as_dual_pointer(index)
    }

    fn payload_as_dual_pointer(&self, index: usize) -> &DualPagePointer {
        let ptr = self.payload_ptr(index);
        debug_assert!(ptr as usize % 8 == 0);
        debug_assert!(self.payload_capacity(index) >= std::mem::size_of::<DualPagePointer>());
        // SAFETY: the payload region is 8-aligned and at least 16 bytes
        // (MIN_PAYLOAD_RESERVATION); DualPagePointer is two atomic words
        // with no invalid bit patterns.
        unsafe { &*(ptr as *const DualPagePointer) }
    }

    /// Turns the slot into a next-layer pointer. Caller holds the slot's
    /// keylock; the remaining-length sentinel is published last so readers
    /// never interpret half-written pointer words.
    pub(crate) fn set_next_layer(&self, index: usize, pointer: VolatilePointer) {
        debug_assert!(self.owner_id(index).load_acquire().is_keylocked());
        let dual = self.payload_as_dual_pointer(index);
        dual.store_volatile(pointer);
        let info = self.info(index);
        let new = SlotInfo::pack(
            NEXT_LAYER_SENTINEL,
            std::mem::size_of::<DualPagePointer>(),
            info.cell_offset(),
            info.payload_capacity(),
        );
        self.slot(index).info.store(new.0, Ordering::Release);
    }

    /// Updates a deleted record's payload length ahead of an insert that
    /// reuses the slot. Caller holds the slot's keylock.
    pub(crate) fn set_payload_length(&self, index: usize, payload_length: usize) {
        debug_assert!(self.owner_id(index).load_acquire().is_keylocked());
        let info = self.info(index);
        debug_assert!(payload_length <= info.payload_capacity());
        let new = SlotInfo::pack(
            info.remaining(),
            payload_length,
            info.cell_offset(),
            info.payload_capacity(),
        );
        self.slot(index).info.store(new.0, Ordering::Release);
    }

    /// Full-key search over the first `count` slots. Returns a matching
    /// record slot, or the layer-pointer slot to descend through when the
    /// key continues past this layer.
    pub fn find_key(
        &self,
        count: usize,
        slice: KeySlice,
        suffix: &[u8],
        remaining: u8,
    ) -> Option<usize> {
        for index in 0..count {
            if self.slice(index) != slice || self.is_defunct(index) {
                continue;
            }
            let stored_remaining = self.remaining_key_length(index);
            if stored_remaining == NEXT_LAYER_SENTINEL {
                if remaining > 8 {
                    return Some(index);
                }
                continue;
            }
            if stored_remaining != remaining {
                continue;
            }
            if remaining <= 8 || self.suffix_matches(index, suffix) {
                return Some(index);
            }
        }
        None
    }

    /// Single-slice fast path: the key is exactly this slice, no suffix.
    pub fn find_key_normalized(&self, start: usize, end: usize, slice: KeySlice) -> Option<usize> {
        for index in start..end {
            if self.slice(index) == slice
                && self.remaining_key_length(index) == 8
                && !self.is_defunct(index)
            {
                return Some(index);
            }
        }
        None
    }

    /// Classifies the page state with respect to an intended insert of
    /// `(slice, suffix, remaining)`, scanning slots `start..end`.
    pub fn find_key_for_reserve(
        &self,
        start: usize,
        end: usize,
        slice: KeySlice,
        suffix: &[u8],
        remaining: u8,
    ) -> FindKeyForReserve {
        for index in start..end {
            if self.slice(index) != slice || self.is_defunct(index) {
                continue;
            }
            let stored_remaining = self.remaining_key_length(index);
            if stored_remaining == NEXT_LAYER_SENTINEL {
                if remaining > 8 {
                    return FindKeyForReserve::ExactMatchLayerPointer(index);
                }
                continue;
            }
            if stored_remaining == remaining
                && (remaining <= 8 || self.suffix_matches(index, suffix))
            {
                return FindKeyForReserve::ExactMatchLocalRecord(index);
            }
            // Two records with suffixes under one slice cannot coexist in a
            // border page; the stored one must move to a next layer. Keys
            // that end within the slice are distinct by length and coexist.
            if stored_remaining > 8 && remaining > 8 {
                return FindKeyForReserve::ConflictingLocalRecord(index);
            }
        }
        FindKeyForReserve::NotFound
    }

    /// Appends a new slot at `index` (== the current key count) as a
    /// deleted placeholder. Page lock with the inserting state must be
    /// held; the caller bumps the key count afterwards.
    pub(crate) fn reserve_record_space(
        &self,
        index: usize,
        initial_id: XctId,
        slice: KeySlice,
        suffix: &[u8],
        remaining: u8,
        payload_count: usize,
    ) {
        debug_assert!(self.version().get().is_locked());
        debug_assert!(index < BORDER_MAX_KEYS);
        debug_assert_eq!(Self::suffix_bytes_of(remaining), suffix.len());

        let suffix_area = align8(suffix.len());
        let capacity = align8(payload_count.max(MIN_PAYLOAD_RESERVATION));
        let watermark = self.cell_watermark.load(Ordering::Acquire) as usize;
        debug_assert!(suffix_area + capacity <= watermark);
        let cell_offset = watermark - suffix_area - capacity;

        // SAFETY: the page lock gives us exclusive right to the unused cell
        // region below the watermark and to slot `index`.
        unsafe {
            let cell = self.cells_base().add(cell_offset);
            std::ptr::copy_nonoverlapping(suffix.as_ptr(), cell, suffix.len());
            std::ptr::write_bytes(cell.add(suffix_area), 0, capacity);
        }
        self.cell_watermark
            .store(cell_offset as u32, Ordering::Release);

        let slot = self.slot(index);
        slot.slice.store(slice, Ordering::Release);
        slot.info.store(
            SlotInfo::pack(remaining, payload_count, cell_offset, capacity).0,
            Ordering::Release,
        );
        slot.owner_id.store_release(initial_id);
    }

    /// Copies one record from `source[from]` into this page's next free
    /// slot during a split. The source owner's keylock must be held so the
    /// payload cannot change mid-copy.
    fn append_from(&self, source: &BorderPage, from: usize, to: usize, owner: XctId) {
        let info = source.info(from);
        let remaining = info.remaining();
        let suffix_area = align8(Self::suffix_bytes_of(remaining));
        let capacity = info.payload_capacity();

        let watermark = self.cell_watermark.load(Ordering::Acquire) as usize;
        debug_assert!(suffix_area + capacity <= watermark);
        let cell_offset = watermark - suffix_area - capacity;

        // SAFETY: this page is unpublished (we own it exclusively); the
        // source cell is stable under the source owner's keylock.
        unsafe {
            std::ptr::copy_nonoverlapping(
                source.cells_base().add(info.cell_offset()),
                self.cells_base().add(cell_offset),
                suffix_area + capacity,
            );
        }
        self.cell_watermark
            .store(cell_offset as u32, Ordering::Release);

        let slot = self.slot(to);
        slot.slice
            .store(source.slice(from), Ordering::Release);
        slot.info.store(
            SlotInfo::pack(remaining, info.payload_length(), cell_offset, capacity).0,
            Ordering::Release,
        );
        slot.owner_id.store_release(owner);
    }

    /// Splits this page, installing a freshly allocated right sibling as
    /// its foster child. The sibling covers `[fence, high_fence)` and is
    /// returned still locked; this page retains `[low_fence, fence)`.
    ///
    /// The split point is the median of the live distinct slices, ties
    /// toward the higher side. A trigger above every live slice fences
    /// exactly at the trigger and moves nothing, which turns ascending
    /// workloads into cheap append splits; a page with no live slices left
    /// fences at its own low fence, handing the whole range to the fresh
    /// sibling.
    ///
    /// If this page already had a foster child, the new sibling inherits
    /// the old link, forming a foster chain that readers follow and
    /// adoption unwinds one link at a time.
    pub(crate) fn split_foster<'a>(
        &'a self,
        core: &mut CoreMemory,
        trigger: KeySlice,
    ) -> StorageResult<&'a BorderPage> {
        debug_assert!(self.version().get().is_locked());
        self.version().set_splitting();
        let count = self.version().get().key_count();

        let mut live: SmallVec<[KeySlice; BORDER_MAX_KEYS]> = SmallVec::new();
        for index in 0..count {
            if !self.owner_id(index).load_acquire().is_moved() {
                live.push(self.slice(index));
            }
        }
        live.sort_unstable();
        live.dedup();

        let fence = if live.is_empty() {
            // Only relocation tombstones left; hand the whole range to a
            // fresh sibling and let this page go dormant.
            self.base.low_fence()
        } else if trigger > *live.last().unwrap() {
            // Append pattern: fence exactly at the trigger, nothing moves.
            trigger
        } else {
            live[live.len() / 2]
        };

        let offset = core.grab_free_page()?;
        let node = core.node();
        let pointer = VolatilePointer::new(node, 0, 0, offset);
        let frame = core.resolver().pool(node).resolve(offset);
        let high_fence = self.base.high_fence();
        let supremum = self.version().get().is_high_fence_supremum();
        // SAFETY: the frame was just grabbed; nobody else references it.
        let sibling = unsafe {
            BorderPage::initialize(
                frame,
                self.base.storage_id(),
                pointer,
                self.layer(),
                false,
                fence,
                high_fence,
                supremum,
                true,
            )
        };

        // A pre-existing foster child moves one link down the chain.
        if self.version().get().has_foster_child() {
            sibling
                .base()
                .set_foster(self.base.foster_fence(), self.base.foster_child());
        }

        let mut moved = 0usize;
        for index in 0..count {
            if self.slice(index) < fence {
                continue;
            }
            let owner = self.owner_id(index);
            let locked_id = owner.keylock_unconditional();
            if locked_id.is_moved() {
                // Tombstoned by an earlier split in the chain.
                owner.release_keylock_with(XctId(locked_id.xct_info()));
                continue;
            }
            sibling.append_from(self, index, moved, XctId(locked_id.xct_info()));
            moved += 1;
            owner.release_keylock_with(XctId(locked_id.xct_info()).with_moved());
        }
        sibling.version().set_key_count(moved);

        self.base.set_foster(fence, pointer);
        Ok(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::INFIMUM_SLICE;
    use crate::memory::{PagePool, PageResolver};
    use std::sync::Arc;

    fn make_core() -> CoreMemory {
        let pools = Arc::new(vec![PagePool::new(0, 64)]);
        CoreMemory::new(0, PageResolver::new(pools))
    }

    fn make_page(core: &mut CoreMemory) -> &'static BorderPage {
        let offset = core.grab_free_page().unwrap();
        let frame = core.resolver().pool(0).resolve(offset);
        let pointer = VolatilePointer::new(0, 0, 0, offset);
        unsafe {
            BorderPage::initialize(frame, 1, pointer, 0, true, INFIMUM_SLICE, u64::MAX, true, false)
        }
    }

    fn reserve(page: &BorderPage, index: usize, slice: KeySlice, suffix: &[u8], remaining: u8) {
        page.version().lock();
        page.reserve_record_space(
            index,
            XctId::new(1, 0).with_deleted(true),
            slice,
            suffix,
            remaining,
            8,
        );
        page.version().set_inserting_and_increment_key_count();
        page.version().unlock();
    }

    #[test]
    fn border_page_fills_the_frame_exactly() {
        assert_eq!(std::mem::size_of::<BorderPage>(), PAGE_SIZE);
    }

    #[test]
    fn reserve_then_find_normalized() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 42, b"", 8);

        assert_eq!(page.find_key_normalized(0, 1, 42), Some(0));
        assert_eq!(page.find_key_normalized(0, 1, 43), None);
        assert_eq!(page.slice(0), 42);
        assert_eq!(page.payload_length(0), 8);
        assert!(page.owner_id(0).load_acquire().is_deleted());
    }

    #[test]
    fn find_key_distinguishes_suffixes() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 100, b"alpha", 13);

        assert_eq!(page.find_key(1, 100, b"alpha", 13), Some(0));
        assert_eq!(page.find_key(1, 100, b"beta!", 13), None);
        assert_eq!(page.find_key(1, 100, b"", 8), None);
        assert_eq!(page.find_key(1, 101, b"alpha", 13), None);
    }

    #[test]
    fn keys_ending_in_slice_coexist_with_suffixed_keys() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 7, b"suffixxx", 16);

        // Same slice, no suffix: a distinct key, not a conflict.
        assert_eq!(
            page.find_key_for_reserve(0, 1, 7, b"", 8),
            FindKeyForReserve::NotFound
        );
        // Same slice, different suffix: must promote to a next layer.
        assert_eq!(
            page.find_key_for_reserve(0, 1, 7, b"other!!!", 16),
            FindKeyForReserve::ConflictingLocalRecord(0)
        );
        // Exactly the stored key.
        assert_eq!(
            page.find_key_for_reserve(0, 1, 7, b"suffixxx", 16),
            FindKeyForReserve::ExactMatchLocalRecord(0)
        );
    }

    #[test]
    fn defunct_slots_are_invisible_to_searches() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 5, b"", 8);

        // Retire the deleted placeholder the way the reserve path does.
        let owner = page.owner_id(0);
        let locked = owner.keylock_unconditional();
        owner.release_keylock_with(XctId(locked.xct_info()).with_moved());

        assert_eq!(page.find_key_normalized(0, 1, 5), None);
        assert_eq!(page.find_key(1, 5, b"", 8), None);
        assert_eq!(
            page.find_key_for_reserve(0, 1, 5, b"", 8),
            FindKeyForReserve::NotFound
        );

        // A fresh slot for the same key is found instead of the tombstone.
        reserve(page, 1, 5, b"", 8);
        assert_eq!(page.find_key_normalized(0, 2, 5), Some(1));
        assert_eq!(page.find_key(2, 5, b"", 8), Some(1));
        assert_eq!(
            page.find_key_for_reserve(0, 2, 5, b"", 8),
            FindKeyForReserve::ExactMatchLocalRecord(1)
        );
    }

    #[test]
    fn retired_suffixed_slot_no_longer_conflicts() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 7, b"suffixxx", 16);

        let owner = page.owner_id(0);
        let locked = owner.keylock_unconditional();
        owner.release_keylock_with(XctId(locked.xct_info()).with_moved());

        assert_eq!(
            page.find_key_for_reserve(0, 1, 7, b"other!!!", 16),
            FindKeyForReserve::NotFound
        );
    }

    #[test]
    fn can_accommodate_tracks_cell_space() {
        let mut core = make_core();
        let page = make_page(&mut core);
        assert!(page.can_accommodate(0, 8, 64));
        assert!(!page.can_accommodate(BORDER_MAX_KEYS, 8, 8));
        assert!(!page.can_accommodate(0, 8, BORDER_CELL_BYTES));
    }

    #[test]
    fn payload_region_is_at_least_a_dual_pointer() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 1, b"", 8);
        assert!(page.payload_capacity(0) >= std::mem::size_of::<DualPagePointer>());
    }

    #[test]
    fn set_next_layer_publishes_sentinel_last() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 9, b"tail-of-key", 19);

        let target = VolatilePointer::new(0, 0, 0, 33);
        page.owner_id(0).keylock_unconditional();
        page.set_next_layer(0, target);
        let id = page.owner_id(0).load_acquire();
        page.owner_id(0).release_keylock_with(XctId(id.xct_info()).advanced());

        assert!(page.does_point_to_layer(0));
        assert_eq!(page.next_layer_pointer(0).volatile(), target);
        // A single-slice probe must not match the pointer slot.
        assert_eq!(page.find_key(1, 9, b"", 8), None);
        // A longer key matches it and descends.
        assert_eq!(page.find_key(1, 9, b"whatever-tail", 21), Some(0));
    }

    #[test]
    fn split_foster_moves_upper_half_and_tombstones() {
        let mut core = make_core();
        let page = make_page(&mut core);
        for (i, slice) in [10u64, 20, 30, 40].iter().enumerate() {
            reserve(page, i, *slice, b"", 8);
        }

        page.version().lock();
        let sibling = page.split_foster(&mut core, 25).unwrap();
        page.version().unlock();
        sibling.version().unlock();

        assert!(page.base().has_foster_child());
        assert_eq!(page.base().foster_fence(), 30);
        assert_eq!(sibling.base().low_fence(), 30);
        assert_eq!(sibling.version().get().key_count(), 2);
        assert_eq!(sibling.find_key_normalized(0, 2, 30), Some(0));
        assert_eq!(sibling.find_key_normalized(0, 2, 40), Some(1));
        assert!(sibling.version().get().is_high_fence_supremum());

        // Old slots remain, flagged moved.
        assert!(page.owner_id(2).load_acquire().is_moved());
        assert!(page.owner_id(3).load_acquire().is_moved());
        assert!(!page.owner_id(0).load_acquire().is_moved());
        assert_eq!(page.version().get().split_counter(), 1);
    }

    #[test]
    fn split_with_trigger_above_all_moves_nothing() {
        let mut core = make_core();
        let page = make_page(&mut core);
        for (i, slice) in [10u64, 20].iter().enumerate() {
            reserve(page, i, *slice, b"", 8);
        }

        page.version().lock();
        let sibling = page.split_foster(&mut core, 99).unwrap();
        page.version().unlock();
        sibling.version().unlock();

        assert_eq!(page.base().foster_fence(), 99);
        assert_eq!(sibling.version().get().key_count(), 0);
        assert!(!page.owner_id(0).load_acquire().is_moved());
        assert!(!page.owner_id(1).load_acquire().is_moved());
    }

    #[test]
    fn split_with_trigger_below_all_still_takes_the_median() {
        let mut core = make_core();
        let page = make_page(&mut core);
        for (i, slice) in [50u64, 60].iter().enumerate() {
            reserve(page, i, *slice, b"", 8);
        }

        page.version().lock();
        let sibling = page.split_foster(&mut core, 5).unwrap();
        page.version().unlock();
        sibling.version().unlock();

        assert_eq!(page.base().foster_fence(), 60);
        assert_eq!(sibling.version().get().key_count(), 1);
        assert!(!page.owner_id(0).load_acquire().is_moved());
        assert!(page.owner_id(1).load_acquire().is_moved());
    }

    #[test]
    fn all_tombstone_split_hands_over_the_whole_range() {
        let mut core = make_core();
        let page = make_page(&mut core);
        reserve(page, 0, 10, b"", 8);

        page.version().lock();
        // First split moves the only live record out.
        let first = page.split_foster(&mut core, 5).unwrap();
        first.version().unlock();
        assert!(page.owner_id(0).load_acquire().is_moved());

        // Second split finds no live record; the sibling covers the whole
        // remaining range and chains to the first.
        let second = page.split_foster(&mut core, 5).unwrap();
        page.version().unlock();
        second.version().unlock();

        assert_eq!(page.base().foster_fence(), INFIMUM_SLICE);
        assert_eq!(second.base().low_fence(), INFIMUM_SLICE);
        assert_eq!(second.version().get().key_count(), 0);
        assert!(second.base().has_foster_child());
        assert_eq!(second.base().foster_fence(), 10);
        assert_eq!(
            second.base().foster_child().offset(),
            first.base().page_id().offset()
        );
    }

    #[test]
    fn chained_split_inherits_the_old_foster_link() {
        let mut core = make_core();
        let page = make_page(&mut core);
        for (i, slice) in [10u64, 20, 30, 40].iter().enumerate() {
            reserve(page, i, *slice, b"", 8);
        }

        page.version().lock();
        let first = page.split_foster(&mut core, 25).unwrap();
        first.version().unlock();
        let second = page.split_foster(&mut core, 15).unwrap();
        page.version().unlock();
        second.version().unlock();

        // page -> second -> first.
        assert_eq!(page.base().foster_child().offset(), second.base().page_id().offset());
        assert!(second.base().has_foster_child());
        assert_eq!(
            second.base().foster_child().offset(),
            first.base().page_id().offset()
        );
        assert_eq!(second.base().foster_fence(), 30);
        assert_eq!(second.base().low_fence(), 20);
    }
}
