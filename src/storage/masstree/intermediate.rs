//! # Intermediate Page
//!
//! An internal B⁺-tree node partitioned into up to 10 independently
//! versioned *minipages*, each holding up to 16 child pointers and 15
//! separators. The two-level partitioning keeps writer contention local: a
//! routine adoption locks one minipage, not the page.
//!
//! ```text
//! +-----------------------------+
//! | Page Header (64B)           |
//! +-----------------------------+
//! | Page Separators [9]         |  route a slice to a minipage
//! +-----------------------------+
//! | MiniPage 0..9               |  each: version | separators[15]
//! |                             |        | pointers[16]
//! +-----------------------------+
//! ```
//!
//! `key_count` in the page version is the number of page-level separators
//! (`minipages - 1`); `key_count` in a minipage version is its separator
//! count (`pointers - 1`). Separators are strictly increasing; pointer `i`
//! covers `[sep[i-1], sep[i])`.
//!
//! ## Locking Order
//!
//! Structural changes follow one order: page lock, then minipage lock, then
//! child page lock. The adoption fast path takes only the minipage lock; as
//! soon as it verifies the captured page/minipage snapshots under that lock
//! it is linearized against the heavier paths, which stage their state bits
//! on the page version immediately after acquiring the page lock.
//!
//! Readers take no locks. Anyone who raced a relocation re-checks the page
//! and minipage versions hand-over-hand and retries; every pointer word
//! they can observe mid-change still addresses a live page, so the worst
//! outcome before the re-check is a wasted resolve.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{INTERMEDIATE_MINIPAGES, MINIPAGE_POINTERS, PAGE_SIZE};
use crate::error::{ErrorCode, StorageResult};
use crate::memory::CoreMemory;
use crate::storage::masstree::{
    KeySlice, MasstreePage, PageVersion, UnlockScope, VersionSnapshot,
};
use crate::storage::{DualPagePointer, PageType, StorageId, VolatilePointer};

/// One lockable sub-node of an intermediate page.
#[repr(C)]
pub struct MiniPage {
    version: PageVersion,
    separators: [AtomicU64; MINIPAGE_POINTERS - 1],
    pointers: [DualPagePointer; MINIPAGE_POINTERS],
}

impl MiniPage {
    pub fn version(&self) -> &PageVersion {
        &self.version
    }

    pub fn stable_version(&self) -> VersionSnapshot {
        self.version.stable()
    }

    pub fn separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(Ordering::Acquire)
    }

    pub fn pointer(&self, index: usize) -> &DualPagePointer {
        &self.pointers[index]
    }

    /// Index of the child pointer covering `slice`, given a separator
    /// count.
    pub fn find_pointer(&self, key_count: usize, slice: KeySlice) -> usize {
        debug_assert!(key_count < MINIPAGE_POINTERS);
        for index in 0..key_count {
            if slice < self.separator(index) {
                return index;
            }
        }
        key_count
    }

    pub(crate) fn set_separator(&self, index: usize, separator: KeySlice) {
        self.separators[index].store(separator, Ordering::Release);
    }

    /// Copies separators, pointers and the version word (unlocked) from
    /// `src`. Used by minipage relocation under the page lock; `src`'s
    /// minipage lock must be held so nothing shifts mid-copy.
    fn copy_content_from(&self, src: &MiniPage) {
        let count = src.version.get().key_count();
        for index in 0..count {
            self.set_separator(index, src.separator(index));
        }
        for index in 0..=count {
            self.pointers[index].copy_from(&src.pointers[index]);
        }
        self.version.overwrite(src.version.get().without_lock());
    }
}

#[repr(C)]
pub struct IntermediatePage {
    base: MasstreePage,
    separators: [AtomicU64; INTERMEDIATE_MINIPAGES - 1],
    minipages: [MiniPage; INTERMEDIATE_MINIPAGES],
}

const _: () = assert!(std::mem::size_of::<IntermediatePage>() <= PAGE_SIZE);

impl IntermediatePage {
    /// Initializes a frame as an empty intermediate page.
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
    ) -> &'a IntermediatePage {
        MasstreePage::initialize(
            frame,
            PageType::MasstreeIntermediate,
            storage_id,
            page_id,
            layer,
            root,
            low_fence,
            high_fence,
            high_fence_supremum,
            locked,
        );
        &*(frame as *const IntermediatePage)
    }

    pub fn base(&self) -> &MasstreePage {
        &self.base
    }

    pub fn version(&self) -> &PageVersion {
        self.base.version()
    }

    pub fn separator(&self, index: usize) -> KeySlice {
        self.separators[index].load(Ordering::Acquire)
    }

    pub(crate) fn set_separator(&self, index: usize, separator: KeySlice) {
        self.separators[index].store(separator, Ordering::Release);
    }

    pub fn minipage(&self, index: usize) -> &MiniPage {
        debug_assert!(index < INTERMEDIATE_MINIPAGES);
        &self.minipages[index]
    }

    /// Index of the minipage covering `slice`, given the page separator
    /// count.
    pub fn find_minipage(&self, key_count: usize, slice: KeySlice) -> usize {
        debug_assert!(key_count < INTERMEDIATE_MINIPAGES);
        for index in 0..key_count {
            if slice < self.separator(index) {
                return index;
            }
        }
        key_count
    }

    /// Absorbs `child`'s foster sibling as a proper child of this page.
    ///
    /// `Ok(())` means the foster link is gone (adopted here, or by someone
    /// else); the caller re-reads this page and carries on.
    /// `Err(MasstreeRetry)` means a precondition failed or the page was
    /// restructured to make room; the caller restarts the descent.
    pub(crate) fn adopt_from_child(
        &self,
        core: &mut CoreMemory,
        parent_stable: VersionSnapshot,
        minipage_index: usize,
        mini_stable: VersionSnapshot,
        pointer_index: usize,
        child: &MasstreePage,
    ) -> StorageResult<()> {
        let minipage = self.minipage(minipage_index);
        minipage.version.lock();
        let mini_scope = UnlockScope(&minipage.version);

        // The captured snapshots must still hold now that we own the
        // minipage; any published page- or minipage-level change since then
        // may have rerouted the slice.
        if self
            .version()
            .get()
            .without_lock()
            .differs_beyond_lock(parent_stable)
            || minipage
                .version
                .get()
                .without_lock()
                .differs_beyond_lock(mini_stable)
        {
            return Err(ErrorCode::MasstreeRetry);
        }
        let pointer = minipage.pointer(pointer_index);
        let current = core.resolver().resolve(pointer.volatile());
        if !std::ptr::eq(current as *const u8, child as *const _ as *const u8) {
            return Err(ErrorCode::MasstreeRetry);
        }

        child.version().lock();
        let child_scope = UnlockScope(child.version());
        if !child.version().get().has_foster_child() {
            // Lost the race; the link is already gone, which is all we
            // wanted.
            return Ok(());
        }

        let fence = child.foster_fence();
        let foster = child.foster_child();
        let mini_count = minipage.version.get().key_count();

        if mini_count + 1 >= MINIPAGE_POINTERS {
            drop(child_scope);
            drop(mini_scope);
            self.make_room(core, minipage_index)?;
            return Err(ErrorCode::MasstreeRetry);
        }

        // Shift the upper separators/pointers right and wedge the foster
        // child in after its former parent.
        for index in (pointer_index..mini_count).rev() {
            minipage.set_separator(index + 1, minipage.separator(index));
        }
        minipage.set_separator(pointer_index, fence);
        for index in ((pointer_index + 1)..=mini_count).rev() {
            minipage.pointers[index + 1].copy_from(&minipage.pointers[index]);
        }
        minipage.pointers[pointer_index + 1]
            .store_volatile(foster.without_flags());
        minipage.version.set_inserting_and_increment_key_count();

        // The child keeps [low_fence, foster_fence); readers that captured
        // the wider range must restart, hence the split-counter bump.
        child.set_high_fence(fence);
        child.version().set_high_fence_supremum(false);
        child.clear_foster();
        child.version().set_splitting();

        Ok(())
    }

    /// Makes room for another pointer around a full minipage: splits the
    /// minipage, or foster-splits the whole page when every minipage slot
    /// is taken. Callers restart their descent afterwards.
    fn make_room(&self, core: &mut CoreMemory, minipage_index: usize) -> StorageResult<()> {
        self.version().lock();
        let page_scope = UnlockScope(self.version());
        if self.version().get().has_foster_child() {
            // A pending foster split already provides the room.
            return Ok(());
        }
        // Staged before touching any minipage, so concurrent adopters'
        // snapshot verification fails fast.
        self.version().set_inserting();

        let minipage = self.minipage(minipage_index);
        minipage.version.lock();
        let mini_count = minipage.version.get().key_count();
        if mini_count + 1 < MINIPAGE_POINTERS {
            minipage.version.unlock();
            return Ok(());
        }

        let page_count = self.version().get().key_count();
        if page_count + 1 >= INTERMEDIATE_MINIPAGES {
            minipage.version.unlock();
            self.version().set_splitting();
            return self.split_foster(core);
        }

        // Slide the higher minipages one slot right.
        for index in ((minipage_index + 1)..=page_count).rev() {
            let src = self.minipage(index);
            src.version.lock();
            self.minipage(index + 1).copy_content_from(src);
            src.version.unlock();
        }
        for index in (minipage_index..page_count).rev() {
            self.set_separator(index + 1, self.separator(index));
        }

        // Split the full minipage down the middle into itself and the slot
        // just vacated.
        let keep = MINIPAGE_POINTERS / 2;
        let middle = minipage.separator(keep - 1);
        let right = self.minipage(minipage_index + 1);
        for index in keep..mini_count {
            right.set_separator(index - keep, minipage.separator(index));
        }
        for index in keep..=mini_count {
            right.pointers[index - keep].copy_from(&minipage.pointers[index]);
        }
        right.version.overwrite(VersionSnapshot(0));
        right.version.set_key_count(mini_count - keep);

        self.set_separator(minipage_index, middle);
        self.version().set_inserting_and_increment_key_count();

        minipage.version.set_key_count(keep - 1);
        minipage.version.set_splitting();
        minipage.version.unlock();
        drop(page_scope);
        Ok(())
    }

    /// Foster-splits this page at a minipage boundary. Page lock must be
    /// held with the splitting state staged; the sibling is fully published
    /// (and unlocked) before return.
    pub(crate) fn split_foster(&self, core: &mut CoreMemory) -> StorageResult<()> {
        debug_assert!(self.version().get().is_locked());
        debug_assert!(self.version().get().is_splitting());
        let count = self.version().get().key_count();
        debug_assert!(count >= 1, "splitting an intermediate page with one minipage");

        let keep = (count + 1) / 2;
        let fence = self.separator(keep - 1);

        let offset = core.grab_free_page()?;
        let node = core.node();
        let pointer = VolatilePointer::new(node, 0, 0, offset);
        let frame = core.resolver().pool(node).resolve(offset);
        let high_fence = self.base.high_fence();
        let supremum = self.version().get().is_high_fence_supremum();
        // SAFETY: freshly grabbed frame, exclusively ours.
        let sibling = unsafe {
            IntermediatePage::initialize(
                frame,
                self.base.storage_id(),
                pointer,
                self.base.layer(),
                false,
                fence,
                high_fence,
                supremum,
                true,
            )
        };

        if self.version().get().has_foster_child() {
            sibling
                .base()
                .set_foster(self.base.foster_fence(), self.base.foster_child());
        }

        for index in keep..=count {
            let src = self.minipage(index);
            src.version.lock();
            sibling.minipage(index - keep).copy_content_from(src);
            src.version.unlock();
        }
        for index in keep..count {
            sibling.set_separator(index - keep, self.separator(index));
        }
        sibling.version().set_key_count(count - keep);
        sibling.version().unlock();

        self.version().set_key_count(keep - 1);
        self.base.set_foster(fence, pointer);
        Ok(())
    }
}
