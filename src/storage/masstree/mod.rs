//! # Masstree Storage
//!
//! The primary index of the engine: a trie of B⁺-trees over fixed-width
//! 64-bit key slices. Arbitrary-length binary keys are viewed 8 bytes at a
//! time; layer `L` indexes bytes `[8L, 8L+8)` as a big-endian u64. Keys that
//! collide on a full slice but diverge later descend into a deeper layer,
//! each layer being an independent B⁺-tree of border (leaf) and intermediate
//! pages.
//!
//! ## Page Kinds
//!
//! - [`BorderPage`] — leaf. A slot table of records keyed by
//!   `(slice, suffix)`; a slot may instead hold a pointer to the next
//!   layer's root.
//! - [`IntermediatePage`] — internal node, partitioned into independently
//!   lockable minipages to spread writer contention.
//!
//! ## Concurrency
//!
//! Traversal is latch-free: readers capture stable [`PageVersion`] snapshots
//! and re-validate hand-over-hand while descending. Structural changes
//! (splits, adoption, root growth, next-layer creation) are system
//! transactions: they take page locks, never block readers, and leave the
//! logical record set untouched.
//!
//! A split installs a *foster child*: a temporary right sibling that co-owns
//! the page's key range until an ancestor adopts it or the root grows. A
//! descending reader that sees a foster child simply follows the link.
//!
//! ## Fences
//!
//! Every page covers a half-open slice range `[low_fence, high_fence)`;
//! `high_fence` is +infinity iff the version word's supremum bit is set.
//! With a foster child, the page logically retains `[low_fence,
//! foster_fence)` and the foster covers `[foster_fence, high_fence)`.

mod border;
mod intermediate;
mod tree;
mod version;

pub use border::{BorderPage, FindKeyForReserve};
pub use intermediate::{IntermediatePage, MiniPage};
pub use tree::MasstreeStorage;
pub use version::{PageVersion, UnlockScope, VersionSnapshot};

use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::MAX_KEY_LENGTH;
use crate::storage::{PageType, StorageId, VolatilePointer};

/// Big-endian 64-bit view of 8 consecutive key bytes; the indexing key
/// within one layer.
pub type KeySlice = u64;

/// Extracts layer `layer`'s slice of `key`, zero-padding past the end.
pub fn slice_layer(key: &[u8], layer: usize) -> KeySlice {
    let start = layer * 8;
    debug_assert!(start < key.len() && key.len() <= MAX_KEY_LENGTH);
    let end = (start + 8).min(key.len());
    let mut bytes = [0u8; 8];
    bytes[..end - start].copy_from_slice(&key[start..end]);
    u64::from_be_bytes(bytes)
}

/// Bytes of `key` beyond layer `layer`'s slice (the suffix stored in a
/// border slot when the key outlives the slice).
pub fn suffix_of_layer(key: &[u8], layer: usize) -> &[u8] {
    let start = ((layer + 1) * 8).min(key.len());
    &key[start..]
}

/// Common header shared by border and intermediate pages. Exactly 64 bytes
/// so the page body starts cache-line aligned.
///
/// `low_fence` is immutable after initialization. `high_fence` shrinks when
/// an adoption absorbs a foster child, and the foster words change under the
/// page lock, so those three are atomics read with acquire ordering.
#[repr(C)]
pub struct MasstreePageHeader {
    page_id: u64,
    storage_id: StorageId,
    page_type: u8,
    layer: u8,
    flags: u16,
    version: PageVersion,
    low_fence: u64,
    high_fence: AtomicU64,
    foster_fence: AtomicU64,
    foster_child: AtomicU64,
    _reserved: u64,
}

const _: () = assert!(std::mem::size_of::<MasstreePageHeader>() == crate::config::PAGE_HEADER_SIZE);

/// The polymorphic view of a masstree page frame: just the header. Concrete
/// accessors live on [`BorderPage`] and [`IntermediatePage`], which embed
/// this as their first field.
#[repr(C)]
pub struct MasstreePage {
    header: MasstreePageHeader,
}

impl MasstreePage {
    /// Lays a fresh header over a zeroed frame.
    ///
    /// # Safety
    /// `frame` must point at a page frame this thread exclusively owns
    /// (freshly grabbed from the pool, not yet published).
    pub(crate) unsafe fn initialize(
        frame: *mut u8,
        page_type: PageType,
        storage_id: StorageId,
        page_id: VolatilePointer,
        layer: u8,
        root: bool,
        low_fence: KeySlice,
        high_fence: KeySlice,
        high_fence_supremum: bool,
        locked: bool,
    ) {
        // Reused frames carry stale bytes; page bodies assume zeroed state
        // beyond their published key counts.
        std::ptr::write_bytes(frame, 0, crate::config::PAGE_SIZE);
        let page = &mut *(frame as *mut MasstreePage);
        page.header.page_id = page_id.word;
        page.header.storage_id = storage_id;
        page.header.page_type = page_type as u8;
        page.header.layer = layer;
        page.header.flags = 0;
        page.header._reserved = 0;
        page.header.low_fence = low_fence;
        page.header.high_fence = AtomicU64::new(high_fence);
        page.header.foster_fence = AtomicU64::new(0);
        page.header.foster_child = AtomicU64::new(0);
        page.header.version.init(root, high_fence_supremum, locked);
    }

    pub fn version(&self) -> &PageVersion {
        &self.header.version
    }

    pub fn page_id(&self) -> VolatilePointer {
        VolatilePointer {
            word: self.header.page_id,
        }
    }

    pub fn storage_id(&self) -> StorageId {
        self.header.storage_id
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.header.page_type)
    }

    pub fn is_border(&self) -> bool {
        self.page_type() == PageType::MasstreeBorder
    }

    pub fn layer(&self) -> u8 {
        self.header.layer
    }

    pub fn flags(&self) -> u16 {
        self.header.flags
    }

    pub fn low_fence(&self) -> KeySlice {
        self.header.low_fence
    }

    pub fn high_fence(&self) -> KeySlice {
        self.header.high_fence.load(Ordering::Acquire)
    }

    /// Shrinks the range on adoption. Page lock must be held.
    pub(crate) fn set_high_fence(&self, fence: KeySlice) {
        self.header.high_fence.store(fence, Ordering::Release);
    }

    pub fn foster_fence(&self) -> KeySlice {
        self.header.foster_fence.load(Ordering::Acquire)
    }

    pub fn foster_child(&self) -> VolatilePointer {
        VolatilePointer {
            word: self.header.foster_child.load(Ordering::Acquire),
        }
    }

    pub fn has_foster_child(&self) -> bool {
        self.version().get().has_foster_child()
    }

    /// Installs the foster link. Page lock must be held; the sibling must be
    /// fully initialized before this publishes it.
    pub(crate) fn set_foster(&self, fence: KeySlice, child: VolatilePointer) {
        self.header.foster_fence.store(fence, Ordering::Release);
        self.header.foster_child.store(child.word, Ordering::Release);
        self.version().set_has_foster_child(true);
    }

    /// Ends the foster relationship (adoption or root growth). Only the
    /// version bit is cleared; the stale pointer word stays valid for
    /// readers still holding a pre-adoption snapshot.
    pub(crate) fn clear_foster(&self) {
        self.version().set_has_foster_child(false);
    }

    pub fn within_fences(&self, slice: KeySlice) -> bool {
        slice >= self.low_fence()
            && (self.version().get().is_high_fence_supremum() || slice < self.high_fence())
    }

    /// True when the slice now belongs to the foster child's half of the
    /// range.
    pub fn within_foster_child(&self, slice: KeySlice) -> bool {
        self.has_foster_child() && slice >= self.foster_fence()
    }

    pub fn as_border(&self) -> &BorderPage {
        debug_assert_eq!(self.page_type(), PageType::MasstreeBorder);
        // SAFETY: border frames are initialized as BorderPage and the type
        // byte never changes after initialization.
        unsafe { &*(self as *const MasstreePage as *const BorderPage) }
    }

    pub fn as_intermediate(&self) -> &IntermediatePage {
        debug_assert_eq!(self.page_type(), PageType::MasstreeIntermediate);
        // SAFETY: as above, for intermediate frames.
        unsafe { &*(self as *const MasstreePage as *const IntermediatePage) }
    }

    /// # Safety
    /// `frame` must point at an initialized masstree page frame.
    pub(crate) unsafe fn from_frame<'a>(frame: *mut u8) -> &'a MasstreePage {
        &*(frame as *const MasstreePage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_layer_is_big_endian() {
        let key = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0xAA, 0xBB];
        assert_eq!(slice_layer(&key, 0), 0x0102030405060708);
        assert_eq!(slice_layer(&key, 1), 0xAABB000000000000);
    }

    #[test]
    fn slice_layer_zero_pads_short_tails() {
        let key = [0xFF, 0xEE, 0xDD];
        assert_eq!(slice_layer(&key, 0), 0xFFEEDD0000000000);
    }

    #[test]
    fn suffix_of_layer_clamps_to_key_end() {
        let key = b"0123456789abcdef";
        assert_eq!(suffix_of_layer(key, 0), b"89abcdef");
        assert_eq!(suffix_of_layer(key, 1), b"");
        assert_eq!(suffix_of_layer(b"0123", 0), b"");
    }

    #[test]
    fn header_is_exactly_one_cache_line_group() {
        assert_eq!(
            std::mem::size_of::<MasstreePageHeader>(),
            crate::config::PAGE_HEADER_SIZE
        );
    }
}
