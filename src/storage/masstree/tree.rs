//! # Masstree Storage: Traversal and Record Operations
//!
//! The state machine joining the page primitives into the engine API:
//!
//! - `get_first_root` resolves the storage's root pointer, growing the root
//!   when it carries a foster child, and records the observation in the
//!   transaction's pointer set.
//! - `find_border` descends one layer under hand-over-hand verification:
//!   capture a stable version, pick a child, capture the child's version,
//!   re-read the parent. A change beyond the lock bit means retry; a changed
//!   split counter means the retry must restart from the layer root.
//! - `locate_record` / `reserve_record` walk the trie layer by layer,
//!   following next-layer slots and (for writes) reserving a deleted
//!   placeholder slot where the key will live.
//! - `create_next_layer` and `grow_root` are system transactions: they
//!   restructure pages without touching the logical record set and leave no
//!   read- or write-set entries.
//! - The record operations attach everything to OCC: reads run the
//!   optimistic protocol against the slot's owner id, writes append a redo
//!   log entry and a write-set entry.
//!
//! ## Retry Taxonomy
//!
//! `MasstreeRetry` bubbles out of any traversal step whose snapshot went
//! stale. The public operations loop on it; all other codes propagate to
//! the caller with the transaction left open.

use crate::config::{
    BORDER_CELL_BYTES, INFIMUM_SLICE, MAX_KEY_LENGTH, MAX_RETRIES, SUPREMUM_SLICE,
};
use crate::error::{ErrorCode, StorageResult};
use crate::memory::{CoreMemory, PageResolver};
use crate::storage::masstree::{
    slice_layer, suffix_of_layer, BorderPage, FindKeyForReserve, IntermediatePage, KeySlice,
    MasstreePage, UnlockScope, VersionSnapshot,
};
use crate::storage::{
    DualPagePointer, PrimitivePayload, StorageId, VolatilePointer, POINTER_FLAG_SWAPPABLE,
};
use crate::thread::ThreadContext;
use crate::xct::{optimistic_read, LogType, XctId};

/// One masstree index: a first-root pointer plus the traversal and record
/// operations over the page graph hanging off it.
pub struct MasstreeStorage {
    id: StorageId,
    name: String,
    first_root: DualPagePointer,
    resolver: PageResolver,
}

impl MasstreeStorage {
    /// Allocates the empty first-layer root and the storage handle.
    pub(crate) fn create(
        core: &mut CoreMemory,
        id: StorageId,
        name: &str,
    ) -> StorageResult<Self> {
        let offset = core.grab_free_page()?;
        let node = core.node();
        let pointer = VolatilePointer::new(node, POINTER_FLAG_SWAPPABLE, 0, offset);
        let frame = core.resolver().pool(node).resolve(offset);
        // SAFETY: freshly grabbed frame, exclusively ours until published
        // through first_root below.
        unsafe {
            BorderPage::initialize(
                frame,
                id,
                pointer,
                0,
                true,
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
                false,
            );
        }
        tracing::info!(storage = name, id, "created masstree storage");
        Ok(Self {
            id,
            name: name.to_string(),
            first_root: DualPagePointer::new_volatile(pointer),
            resolver: core.resolver().clone(),
        })
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn resolve_page(&self, pointer: VolatilePointer) -> &MasstreePage {
        // SAFETY: non-null volatile pointers produced by this storage always
        // address initialized masstree frames, which live until teardown.
        unsafe { MasstreePage::from_frame(self.resolver.resolve(pointer)) }
    }

    fn require_xct(&self, context: &ThreadContext) -> StorageResult<()> {
        if context.xct.is_active() {
            Ok(())
        } else {
            Err(ErrorCode::NotInitialized)
        }
    }

    // ------------------------------------------------------------------
    // Root resolution and growth
    // ------------------------------------------------------------------

    fn get_first_root(
        &self,
        context: &mut ThreadContext,
    ) -> StorageResult<(&MasstreePage, VersionSnapshot)> {
        let mut retries = 0usize;
        loop {
            let pointer = self.first_root.volatile();
            debug_assert!(!pointer.is_null());
            let page = self.resolve_page(pointer);
            let stable = page.version().stable();

            if stable.has_foster_child() {
                // Root with a foster child: time for tree growth.
                match self.grow_root(context, &self.first_root, page) {
                    Ok(()) | Err(ErrorCode::MasstreeRetry) => {}
                    Err(e) => return Err(e),
                }
                retries += 1;
                if retries == MAX_RETRIES {
                    tracing::warn!(storage = %self.name, "root growth keeps retrying");
                }
                continue;
            }

            // The pointer may be swapped by growth; observe it for commit
            // validation.
            context
                .xct
                .add_to_pointer_set(self.first_root.volatile_addr(), pointer.word);
            return Ok((page, stable));
        }
    }

    /// Promotes a foster-linked root into a new intermediate root covering
    /// the whole layer, then swaps the root pointer.
    fn grow_root(
        &self,
        context: &mut ThreadContext,
        root_pointer: &DualPagePointer,
        old_root: &MasstreePage,
    ) -> StorageResult<()> {
        if old_root.layer() == 0 {
            tracing::info!(storage = %self.name, "growing first-layer tree root");
        } else {
            tracing::debug!(storage = %self.name, layer = old_root.layer(), "growing in-layer tree root");
        }
        old_root.version().lock();
        let root_scope = UnlockScope(old_root.version());
        let locked = old_root.version().get();
        if !locked.has_foster_child() {
            tracing::info!("someone else has already grown this root");
            return Err(ErrorCode::MasstreeRetry);
        }
        if !locked.is_root() {
            // The pointer was swapped and this page split again as an
            // ordinary child; growth is no longer ours to do.
            return Err(ErrorCode::MasstreeRetry);
        }
        let observed = root_pointer.volatile();
        if !std::ptr::eq(
            self.resolve_page(observed) as *const MasstreePage,
            old_root as *const MasstreePage,
        ) {
            return Err(ErrorCode::MasstreeRetry);
        }
        debug_assert!(observed.is_swappable());

        let offset = context.core.grab_free_page()?;
        let node = context.core.node();
        let new_pointer = VolatilePointer::new(
            node,
            POINTER_FLAG_SWAPPABLE,
            observed.mod_count().wrapping_add(1),
            offset,
        );
        let frame = self.resolver.pool(node).resolve(offset);
        // SAFETY: freshly grabbed frame, ours until the pointer store below.
        let new_root = unsafe {
            IntermediatePage::initialize(
                frame,
                self.id,
                new_pointer,
                old_root.layer(),
                true,
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
                true,
            )
        };
        let new_scope = UnlockScope(new_root.version());

        // Two children: the old root keeps the lower half, its foster child
        // the upper, separated at the foster fence.
        let minipage = new_root.minipage(0);
        minipage.version().lock();
        minipage.set_separator(0, old_root.foster_fence());
        minipage
            .pointer(0)
            .store_volatile(observed.without_flags());
        minipage
            .pointer(1)
            .store_volatile(old_root.foster_child().without_flags());
        minipage.version().set_key_count(1);
        minipage.version().unlock();
        new_root.version().set_key_count(0);

        drop(new_scope);

        // Publication: swap the root pointer. We hold the old root's lock
        // and verified the pointer still addresses it, so a failed swap
        // means the pointer moved under us; hand the frame back and let
        // the caller re-resolve.
        if !root_pointer.cas_volatile(observed, new_pointer) {
            context.core.release_free_page(offset);
            return Err(ErrorCode::MasstreeRetry);
        }
        // Only torn down after the swap: a failed swap must leave the old
        // root's foster link intact.
        old_root.clear_foster();
        old_root.version().set_root(false);

        // We changed the pointer ourselves; fix our own observation so the
        // transaction does not abort over it.
        context
            .xct
            .overwrite_to_pointer_set(root_pointer.volatile_addr(), new_pointer.word);
        drop(root_scope);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Descent
    // ------------------------------------------------------------------

    fn follow_page(
        &self,
        context: &mut ThreadContext,
        pointer: &DualPagePointer,
        root_in_layer: bool,
    ) -> StorageResult<&MasstreePage> {
        let volatile = pointer.volatile();
        debug_assert!(!volatile.is_null());
        if root_in_layer {
            // In-layer root pointers may be swapped by growth.
            context
                .xct
                .add_to_pointer_set(pointer.volatile_addr(), volatile.word);
        }
        Ok(self.resolve_page(volatile))
    }

    /// Descends through a next-layer slot, growing that layer's root first
    /// if it has a foster child.
    fn follow_layer(
        &self,
        context: &mut ThreadContext,
        parent: &BorderPage,
        index: usize,
    ) -> StorageResult<&MasstreePage> {
        debug_assert!(parent.does_point_to_layer(index));
        if parent.owner_id(index).load_acquire().is_moved() {
            // The slot was relocated by a split; its pointer copy in the
            // foster sibling is the live one.
            return Err(ErrorCode::MasstreeRetry);
        }
        let pointer = parent.next_layer_pointer(index);
        let next_root = self.follow_page(context, pointer, true)?;

        if next_root.version().get().has_foster_child() {
            self.grow_root(context, pointer, next_root)?;
            return self.follow_page(context, pointer, true);
        }
        Ok(next_root)
    }

    /// Finds the border page covering `slice` within one layer, retrying
    /// locally until a descent completes against consistent snapshots.
    fn find_border<'a>(
        &'a self,
        context: &mut ThreadContext,
        layer_root: &'a MasstreePage,
        for_writes: bool,
        slice: KeySlice,
    ) -> StorageResult<(&'a BorderPage, VersionSnapshot)> {
        let mut retries = 0usize;
        loop {
            let stable = layer_root.version().stable();
            let result = if layer_root.is_border() {
                self.find_border_leaf(layer_root.as_border(), stable, slice)
            } else {
                self.find_border_descend(
                    context,
                    layer_root.as_intermediate(),
                    stable,
                    for_writes,
                    slice,
                )
            };
            match result {
                Err(ErrorCode::MasstreeRetry) => {
                    retries += 1;
                    if retries == MAX_RETRIES {
                        tracing::warn!(storage = %self.name, "find_border keeps retrying from the layer root");
                    }
                    continue;
                }
                other => return other,
            }
        }
    }

    fn find_border_descend<'a>(
        &'a self,
        context: &mut ThreadContext,
        mut cur: &'a IntermediatePage,
        mut cur_stable: VersionSnapshot,
        _for_writes: bool,
        slice: KeySlice,
    ) -> StorageResult<(&'a BorderPage, VersionSnapshot)> {
        loop {
            // The slice may belong to a foster sibling; follow the chain.
            if cur_stable.has_foster_child() && slice >= cur.base().foster_fence() {
                let next = self.resolve_page(cur.base().foster_child());
                let next_stable = next.version().stable();
                if !cur.version().get().differs_beyond_lock(cur_stable) {
                    cur = next.as_intermediate();
                    cur_stable = next_stable;
                    continue;
                }
                let renewed = cur.version().stable();
                if renewed.split_counter() != cur_stable.split_counter() {
                    return Err(ErrorCode::MasstreeRetry);
                }
                cur_stable = renewed;
                continue;
            }

            let minipage_index = cur.find_minipage(cur_stable.key_count(), slice);
            let minipage = cur.minipage(minipage_index);
            let mini_stable = minipage.stable_version();
            let pointer_index = minipage.find_pointer(mini_stable.key_count(), slice);
            let pointer = minipage.pointer(pointer_index);
            debug_assert!(!pointer.is_both_null());

            let next = self.follow_page(context, pointer, false)?;
            if next.version().get().has_foster_child() {
                // The child split; absorb its foster sibling before going
                // deeper.
                cur.adopt_from_child(
                    &mut context.core,
                    cur_stable,
                    minipage_index,
                    mini_stable,
                    pointer_index,
                    next,
                )?;
                cur_stable = cur.version().stable();
                continue;
            }

            let next_stable = next.version().stable();
            // Hand-over-hand: the pointer we followed is only trustworthy
            // if the parent (and its minipage) did not change meanwhile.
            let diff = cur.version().get().differs_beyond_lock(cur_stable);
            let diff_mini = minipage.version().get().differs_beyond_lock(mini_stable);
            if !diff && !diff_mini {
                if next.is_border() {
                    return self.find_border_leaf(next.as_border(), next_stable, slice);
                }
                cur = next.as_intermediate();
                cur_stable = next_stable;
                continue;
            }
            let renewed = cur.version().stable();
            if renewed.split_counter() != cur_stable.split_counter() {
                return Err(ErrorCode::MasstreeRetry);
            }
            cur_stable = renewed;
        }
    }

    fn find_border_leaf<'a>(
        &'a self,
        mut cur: &'a BorderPage,
        mut cur_stable: VersionSnapshot,
        slice: KeySlice,
    ) -> StorageResult<(&'a BorderPage, VersionSnapshot)> {
        loop {
            if !cur_stable.has_foster_child() || slice < cur.base().foster_fence() {
                return Ok((cur, cur_stable));
            }
            let next = self.resolve_page(cur.base().foster_child()).as_border();
            let next_stable = next.version().stable();
            if !cur.version().get().differs_beyond_lock(cur_stable) {
                cur = next;
                cur_stable = next_stable;
                continue;
            }
            let renewed = cur.version().stable();
            if renewed.split_counter() != cur_stable.split_counter() {
                return Err(ErrorCode::MasstreeRetry);
            }
            cur_stable = renewed;
        }
    }

    // ------------------------------------------------------------------
    // Locate / reserve
    // ------------------------------------------------------------------

    fn locate_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        for_writes: bool,
    ) -> StorageResult<(&BorderPage, usize)> {
        debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);
        let (mut layer_root, _) = self.get_first_root(context)?;
        let mut layer = 0usize;
        loop {
            let remaining = (key.len() - layer * 8) as u8;
            let slice = slice_layer(key, layer);
            let suffix = suffix_of_layer(key, layer);
            let (border, border_version) =
                self.find_border(context, layer_root, for_writes, slice)?;
            let count = border_version.key_count();
            match border.find_key(count, slice, suffix, remaining) {
                None => return Err(ErrorCode::KeyNotFound),
                Some(index) => {
                    if border.does_point_to_layer(index) {
                        layer_root = self.follow_layer(context, border, index)?;
                        layer += 1;
                        continue;
                    }
                    return Ok((border, index));
                }
            }
        }
    }

    fn locate_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        for_writes: bool,
    ) -> StorageResult<(&BorderPage, usize)> {
        let (layer_root, _) = self.get_first_root(context)?;
        let (border, border_version) = self.find_border(context, layer_root, for_writes, slice)?;
        match border.find_key_normalized(0, border_version.key_count(), slice) {
            None => Err(ErrorCode::KeyNotFound),
            // A single-slice key never descends to a second layer.
            Some(index) => Ok((border, index)),
        }
    }

    fn reserve_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload_count: usize,
    ) -> StorageResult<(&BorderPage, usize)> {
        debug_assert!(!key.is_empty() && key.len() <= MAX_KEY_LENGTH);
        let (mut layer_root, _) = self.get_first_root(context)?;
        let mut layer = 0usize;
        'layers: loop {
            let remaining = (key.len() - layer * 8) as u8;
            let slice = slice_layer(key, layer);
            let suffix = suffix_of_layer(key, layer);
            let (mut border, mut version) =
                self.find_border(context, layer_root, true, slice)?;
            loop {
                // A split may have landed between find_border and now.
                if version.has_foster_child() && slice >= border.base().foster_fence() {
                    let (next, next_version) = self.find_border_leaf(border, version, slice)?;
                    border = next;
                    version = next_version;
                    continue;
                }

                let count = version.key_count();
                let mut matched =
                    border.find_key_for_reserve(0, count, slice, suffix, remaining);

                match matched {
                    FindKeyForReserve::ExactMatchLayerPointer(index) => {
                        layer_root = self.follow_layer(context, border, index)?;
                        layer += 1;
                        continue 'layers;
                    }
                    // A deleted leftover with a smaller cell cannot host
                    // the new payload; that case needs the page lock below
                    // to retire the slot and reserve a fresh one.
                    FindKeyForReserve::ExactMatchLocalRecord(index)
                        if border.payload_capacity(index) >= payload_count
                            || !border.owner_id(index).load_acquire().is_deleted() =>
                    {
                        return Ok((border, index));
                    }
                    _ => {}
                }

                // No match yet; take the lock and finalize the decision.
                // Everything could have happened before this point.
                border.version().lock();
                let scope = UnlockScope(border.version());
                if border.version().get().split_counter() != version.split_counter()
                    || !border.within_fences(slice)
                    || border.within_foster_child(slice)
                {
                    return Err(ErrorCode::MasstreeRetry);
                }
                let locked_count = border.version().get().key_count();
                if locked_count != count && matches!(matched, FindKeyForReserve::NotFound) {
                    // Someone installed new records; re-examine only those.
                    matched = border.find_key_for_reserve(
                        count,
                        locked_count,
                        slice,
                        suffix,
                        remaining,
                    );
                }

                match matched {
                    FindKeyForReserve::ExactMatchLayerPointer(index) => {
                        drop(scope);
                        layer_root = self.follow_layer(context, border, index)?;
                        layer += 1;
                        continue 'layers;
                    }
                    FindKeyForReserve::ExactMatchLocalRecord(index) => {
                        if border.owner_id(index).load_acquire().is_deleted()
                            && border.payload_capacity(index) < payload_count
                            && BorderPage::required_cell_bytes(remaining, payload_count)
                                > BORDER_CELL_BYTES
                        {
                            return Err(ErrorCode::TooLongPayload);
                        }
                        if Self::retire_undersized_placeholder(border, index, payload_count) {
                            // The retired slot stays behind as a skipped
                            // tombstone; the key gets a fresh one.
                            return self.reserve_record_new_record(
                                context,
                                border,
                                slice,
                                remaining,
                                suffix,
                                payload_count,
                            );
                        }
                        return Ok((border, index));
                    }
                    FindKeyForReserve::NotFound => {
                        return self.reserve_record_new_record(
                            context,
                            border,
                            slice,
                            remaining,
                            suffix,
                            payload_count,
                        );
                    }
                    FindKeyForReserve::ConflictingLocalRecord(index) => {
                        // The stored record shares our slice but diverges
                        // later; push it into a next layer, then descend.
                        drop(scope);
                        self.create_next_layer(context, border, index)?;
                        layer_root = self.follow_layer(context, border, index)?;
                        layer += 1;
                        continue 'layers;
                    }
                }
            }
        }
    }

    fn reserve_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        payload_count: usize,
    ) -> StorageResult<(&BorderPage, usize)> {
        let (layer_root, _) = self.get_first_root(context)?;
        let (mut border, mut version) = self.find_border(context, layer_root, true, slice)?;
        loop {
            border.version().lock();
            let scope = UnlockScope(border.version());
            if border.version().get().split_counter() != version.split_counter() {
                return Err(ErrorCode::MasstreeRetry);
            }
            if border.version().get().has_foster_child()
                && slice >= border.base().foster_fence()
            {
                drop(scope);
                let stable = border.version().stable();
                let (next, next_version) = self.find_border_leaf(border, stable, slice)?;
                border = next;
                version = next_version;
                continue;
            }

            // One slice, so it is either a full match or not found.
            let count = border.version().get().key_count();
            if let Some(index) = border.find_key_normalized(0, count, slice) {
                if border.owner_id(index).load_acquire().is_deleted()
                    && border.payload_capacity(index) < payload_count
                    && BorderPage::required_cell_bytes(8, payload_count) > BORDER_CELL_BYTES
                {
                    return Err(ErrorCode::TooLongPayload);
                }
                if Self::retire_undersized_placeholder(border, index, payload_count) {
                    return self.reserve_record_new_record(
                        context,
                        border,
                        slice,
                        8,
                        b"",
                        payload_count,
                    );
                }
                return Ok((border, index));
            }
            return self.reserve_record_new_record(context, border, slice, 8, b"", payload_count);
        }
    }

    /// Retires a deleted placeholder whose reserved cell is smaller than
    /// the payload about to be inserted. The slot is marked moved so every
    /// search skips it from now on and the caller reserves a fresh slot
    /// for the key. Page lock must be held. Returns false when the slot
    /// turned out to be live, promoted, or big enough after all.
    fn retire_undersized_placeholder(
        border: &BorderPage,
        index: usize,
        payload_count: usize,
    ) -> bool {
        debug_assert!(border.version().get().is_locked());
        let owner = border.owner_id(index);
        let locked = owner.keylock_unconditional();
        let retire = locked.is_deleted()
            && !locked.is_moved()
            && !border.does_point_to_layer(index)
            && border.payload_capacity(index) < payload_count;
        if retire {
            owner.release_keylock_with(XctId(locked.xct_info()).with_moved());
        } else {
            owner.release_keylock_with(XctId(locked.xct_info()));
        }
        retire
    }

    /// Installs a deleted placeholder record in `border` (which the caller
    /// holds locked), splitting first when the page is out of room.
    fn reserve_record_new_record<'a>(
        &'a self,
        context: &mut ThreadContext,
        border: &'a BorderPage,
        slice: KeySlice,
        remaining: u8,
        suffix: &[u8],
        payload_count: usize,
    ) -> StorageResult<(&'a BorderPage, usize)> {
        debug_assert!(border.version().get().is_locked());
        let count = border.version().get().key_count();
        if border.can_accommodate(count, remaining, payload_count) {
            let index = Self::reserve_record_new_record_apply(
                border,
                slice,
                remaining,
                suffix,
                payload_count,
            );
            return Ok((border, index));
        }

        // Have to split to make room.
        let sibling = border.split_foster(&mut context.core, slice)?;
        let sibling_scope = UnlockScope(sibling.version());
        let target = if slice >= border.base().foster_fence() {
            sibling
        } else {
            border
        };
        let target_count = target.version().get().key_count();
        if !target.can_accommodate(target_count, remaining, payload_count) {
            if BorderPage::required_cell_bytes(remaining, payload_count) > BORDER_CELL_BYTES {
                tracing::warn!("payload too large for a border page even after a split");
                return Err(ErrorCode::TooLongPayload);
            }
            // The page is crowded with relocation tombstones; retrying
            // descends into the fresher half.
            return Err(ErrorCode::MasstreeRetry);
        }
        let index =
            Self::reserve_record_new_record_apply(target, slice, remaining, suffix, payload_count);
        drop(sibling_scope);
        Ok((target, index))
    }

    fn reserve_record_new_record_apply(
        target: &BorderPage,
        slice: KeySlice,
        remaining: u8,
        suffix: &[u8],
        payload_count: usize,
    ) -> usize {
        debug_assert!(target.version().get().is_locked());
        let index = target.version().get().key_count();
        // A deleted placeholder: physically present, logically absent until
        // some transaction commits an insert over it.
        let initial_id = XctId::new(1, 0).with_deleted(true);
        target.reserve_record_space(index, initial_id, slice, suffix, remaining, payload_count);
        target.version().set_inserting_and_increment_key_count();
        index
    }

    /// Promotes the record in `parent[parent_index]` into a fresh next-layer
    /// root and turns the slot into a layer pointer. A system transaction:
    /// the record's logical value and deletion state are preserved, so no
    /// read- or write-set entries are added.
    fn create_next_layer(
        &self,
        context: &mut ThreadContext,
        parent: &BorderPage,
        parent_index: usize,
    ) -> StorageResult<()> {
        let offset = context.core.grab_free_page()?;
        let node = context.core.node();
        let pointer = VolatilePointer::new(node, 0, 0, offset);
        let frame = self.resolver.pool(node).resolve(offset);

        let owner = parent.owner_id(parent_index);
        let locked = owner.keylock_unconditional();
        if locked.is_moved() {
            context.core.release_free_page(offset);
            owner.release_keylock_with(XctId(locked.xct_info()));
            return Err(ErrorCode::MasstreeRetry);
        }
        if parent.does_point_to_layer(parent_index) {
            // Our effort was a waste, but the goal was achieved.
            tracing::info!("a concurrent thread already created this next layer");
            context.core.release_free_page(offset);
            owner.release_keylock_with(XctId(locked.xct_info()));
            return Ok(());
        }

        let remaining = parent.remaining_key_length(parent_index);
        debug_assert!(remaining > 8);
        let suffix = parent.suffix(parent_index);
        let payload_length = parent.payload_length(parent_index);

        let next_remaining = remaining - 8;
        let mut slice_bytes = [0u8; 8];
        let head = suffix.len().min(8);
        slice_bytes[..head].copy_from_slice(&suffix[..head]);
        let next_slice = u64::from_be_bytes(slice_bytes);
        let next_suffix = &suffix[head..];

        // SAFETY: freshly grabbed frame, ours until published via
        // set_next_layer below.
        let root = unsafe {
            BorderPage::initialize(
                frame,
                self.id,
                pointer,
                parent.layer() + 1,
                true,
                INFIMUM_SLICE,
                SUPREMUM_SLICE,
                true,
                true,
            )
        };
        let root_scope = UnlockScope(root.version());
        // Copy the record, preserving its value and deletion state.
        root.reserve_record_space(
            0,
            XctId(locked.xct_info()),
            next_slice,
            next_suffix,
            next_remaining,
            payload_length,
        );
        // SAFETY: the source payload is frozen under the keylock we hold;
        // the destination page is unpublished.
        unsafe {
            std::ptr::copy_nonoverlapping(
                parent.payload_ptr(parent_index),
                root.payload_ptr(0),
                payload_length,
            );
        }
        root.version().set_key_count(1);

        parent.set_next_layer(parent_index, pointer);

        // Advance the owner id so concurrent observers notice the change at
        // commit time; the pointer slot itself is never "deleted".
        let unlocked = XctId(locked.xct_info()).advanced().with_deleted(false);
        owner.release_keylock_with(unlocked);
        drop(root_scope);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Record operations
    // ------------------------------------------------------------------

    /// Copies the whole payload into `buffer`, returning its length.
    pub fn get_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        buffer: &mut [u8],
    ) -> StorageResult<usize> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record(context, key, false)?;
            storage.retrieve_general(context, border, index, buffer)
        })
    }

    pub fn get_record_part(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        buffer: &mut [u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record(context, key, false)?;
            storage.retrieve_part_general(context, border, index, buffer, payload_offset)
        })
    }

    pub fn get_record_primitive<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload_offset: usize,
    ) -> StorageResult<P> {
        let mut bytes = [0u8; 16];
        self.get_record_part(context, key, &mut bytes[..P::SIZE], payload_offset)?;
        Ok(P::read_from(&bytes[..P::SIZE]))
    }

    pub fn get_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        buffer: &mut [u8],
    ) -> StorageResult<usize> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, false)?;
            storage.retrieve_general(context, border, index, buffer)
        })
    }

    pub fn get_record_part_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        buffer: &mut [u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, false)?;
            storage.retrieve_part_general(context, border, index, buffer, payload_offset)
        })
    }

    pub fn get_record_primitive_normalized<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        payload_offset: usize,
    ) -> StorageResult<P> {
        self.require_xct(context)?;
        let mut bytes = [0u8; 16];
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, false)?;
            storage.retrieve_part_general(
                context,
                border,
                index,
                &mut bytes[..P::SIZE],
                payload_offset,
            )
        })?;
        Ok(P::read_from(&bytes[..P::SIZE]))
    }

    /// Inserts a new record. Fails with `AlreadyExists` if a committed
    /// record lives under the key.
    pub fn insert_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &[u8],
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.reserve_record(context, key, payload.len())?;
            storage.insert_general(context, border, index, key, payload)
        })
    }

    pub fn insert_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        payload: &[u8],
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) =
                storage.reserve_record_normalized(context, slice, payload.len())?;
            storage.insert_general(context, border, index, &slice.to_be_bytes(), payload)
        })
    }

    /// Logically deletes the record under the key.
    pub fn delete_record(&self, context: &mut ThreadContext, key: &[u8]) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record(context, key, true)?;
            storage.delete_general(context, border, index, key)
        })
    }

    pub fn delete_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, true)?;
            storage.delete_general(context, border, index, &slice.to_be_bytes())
        })
    }

    /// Overwrites part of an existing record's payload.
    pub fn overwrite_record(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        payload: &[u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record(context, key, true)?;
            storage.overwrite_general(context, border, index, key, payload, payload_offset)
        })
    }

    pub fn overwrite_record_normalized(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        payload: &[u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, true)?;
            storage.overwrite_general(
                context,
                border,
                index,
                &slice.to_be_bytes(),
                payload,
                payload_offset,
            )
        })
    }

    /// Atomically-in-commit adds `*value` to the numeric payload at
    /// `payload_offset`; `*value` becomes the new value.
    pub fn increment_record<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        key: &[u8],
        value: &mut P,
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record(context, key, true)?;
            storage.increment_general(context, border, index, key, value, payload_offset)
        })
    }

    pub fn increment_record_normalized<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        slice: KeySlice,
        value: &mut P,
        payload_offset: usize,
    ) -> StorageResult<()> {
        self.require_xct(context)?;
        self.retry_loop(|storage| {
            let (border, index) = storage.locate_record_normalized(context, slice, true)?;
            storage.increment_general(
                context,
                border,
                index,
                &slice.to_be_bytes(),
                value,
                payload_offset,
            )
        })
    }

    /// Runs `body` until it stops asking for a global retry.
    fn retry_loop<T>(
        &self,
        mut body: impl FnMut(&Self) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut retries = 0usize;
        loop {
            match body(self) {
                Err(ErrorCode::MasstreeRetry) => {
                    retries += 1;
                    if retries == MAX_RETRIES {
                        tracing::warn!(storage = %self.name, "operation keeps restarting from the first root");
                    }
                }
                other => return other,
            }
        }
    }

    // ------------------------------------------------------------------
    // OCC hooks
    // ------------------------------------------------------------------

    fn retrieve_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        buffer: &mut [u8],
    ) -> StorageResult<usize> {
        let mut result_length = 0usize;
        let owner = border.owner_id(index);
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if observed.is_deleted() {
                // The physical record is surely there; no range lock
                // needed for this not-found.
                return Err(ErrorCode::KeyNotFound);
            }
            let length = border.payload_length(index);
            if length > buffer.len() {
                return Err(ErrorCode::TooSmallPayloadBuffer);
            }
            border.copy_payload(index, 0, &mut buffer[..length]);
            result_length = length;
            Ok(())
        })?;
        Ok(result_length)
    }

    fn retrieve_part_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        buffer: &mut [u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        let owner = border.owner_id(index);
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if observed.is_deleted() {
                return Err(ErrorCode::KeyNotFound);
            }
            if border.payload_length(index) < payload_offset + buffer.len() {
                tracing::warn!("record shorter than requested range");
                return Err(ErrorCode::TooShortPayload);
            }
            border.copy_payload(index, payload_offset, buffer);
            Ok(())
        })
    }

    fn insert_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        be_key: &[u8],
        payload: &[u8],
    ) -> StorageResult<()> {
        let owner = border.owner_id(index);

        // Reusing a deleted slot with a different payload length: fix the
        // length as a tiny system transaction under the keylock, so the id
        // advances and concurrent observers notice.
        {
            let locked = owner.keylock_unconditional();
            let unlocked = XctId(locked.xct_info());
            if locked.is_moved() || border.does_point_to_layer(index) {
                owner.release_keylock_with(unlocked);
                return Err(ErrorCode::MasstreeRetry);
            }
            if !locked.is_deleted() {
                owner.release_keylock_with(unlocked);
                return Err(ErrorCode::AlreadyExists);
            }
            if border.payload_capacity(index) < payload.len() {
                // The slot was deleted and outgrown after we reserved it;
                // another pass retires it and reserves a fresh slot.
                owner.release_keylock_with(unlocked);
                return Err(ErrorCode::MasstreeRetry);
            }
            if border.payload_length(index) != payload.len() {
                border.set_payload_length(index, payload.len());
                owner.release_keylock_with(unlocked.advanced());
            } else {
                owner.release_keylock_with(unlocked);
            }
        }

        // Observe the placeholder for the read set; of two same-key
        // inserters, commit validation aborts the later one.
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if !observed.is_deleted() {
                return Err(ErrorCode::AlreadyExists);
            }
            if border.payload_length(index) != payload.len() {
                // A racing inserter re-sized the slot after our fix.
                return Err(ErrorCode::MasstreeRetry);
            }
            Ok(())
        })?;

        let (log_ptr, log_len) = context.log.push_entry(
            LogType::MasstreeInsert,
            self.id,
            be_key,
            payload,
            0,
            border.layer(),
        );
        context
            .xct
            .add_to_write_set(self.id, owner, border.payload_ptr(index), log_ptr, log_len);
        Ok(())
    }

    fn delete_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        be_key: &[u8],
    ) -> StorageResult<()> {
        let owner = border.owner_id(index);
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if observed.is_deleted() {
                return Err(ErrorCode::KeyNotFound);
            }
            Ok(())
        })?;

        let (log_ptr, log_len) = context.log.push_entry(
            LogType::MasstreeDelete,
            self.id,
            be_key,
            b"",
            0,
            border.layer(),
        );
        context
            .xct
            .add_to_write_set(self.id, owner, border.payload_ptr(index), log_ptr, log_len);
        Ok(())
    }

    fn overwrite_general(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        be_key: &[u8],
        payload: &[u8],
        payload_offset: usize,
    ) -> StorageResult<()> {
        let owner = border.owner_id(index);
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if observed.is_deleted() {
                return Err(ErrorCode::KeyNotFound);
            }
            if border.payload_length(index) < payload_offset + payload.len() {
                tracing::warn!("record shorter than overwrite range");
                return Err(ErrorCode::TooShortPayload);
            }
            Ok(())
        })?;

        let (log_ptr, log_len) = context.log.push_entry(
            LogType::MasstreeOverwrite,
            self.id,
            be_key,
            payload,
            payload_offset,
            border.layer(),
        );
        context
            .xct
            .add_to_write_set(self.id, owner, border.payload_ptr(index), log_ptr, log_len);
        Ok(())
    }

    fn increment_general<P: PrimitivePayload>(
        &self,
        context: &mut ThreadContext,
        border: &BorderPage,
        index: usize,
        be_key: &[u8],
        value: &mut P,
        payload_offset: usize,
    ) -> StorageResult<()> {
        // The optimistic read retries, so the reader must stay idempotent:
        // read into a scratch value, add only after the observation sticks.
        let mut current = P::default();
        let owner = border.owner_id(index);
        optimistic_read(&mut context.xct, self.id, owner, |observed| {
            if border.does_point_to_layer(index) {
                return Err(ErrorCode::MasstreeRetry);
            }
            if observed.is_deleted() {
                return Err(ErrorCode::KeyNotFound);
            }
            if border.payload_length(index) < payload_offset + P::SIZE {
                tracing::warn!("record shorter than increment target");
                return Err(ErrorCode::TooShortPayload);
            }
            let mut bytes = [0u8; 16];
            border.copy_payload(index, payload_offset, &mut bytes[..P::SIZE]);
            current = P::read_from(&bytes[..P::SIZE]);
            Ok(())
        })?;

        *value = value.add(current);
        let mut bytes = [0u8; 16];
        value.write_to(&mut bytes[..P::SIZE]);
        let (log_ptr, log_len) = context.log.push_entry(
            LogType::MasstreeOverwrite,
            self.id,
            be_key,
            &bytes[..P::SIZE],
            payload_offset,
            border.layer(),
        );
        context
            .xct
            .add_to_write_set(self.id, owner, border.payload_ptr(index), log_ptr, log_len);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Returns every page of this storage to the pool. Callers guarantee
    /// quiescence.
    pub(crate) fn release_pages(&self) {
        let pointer = self.first_root.volatile();
        if !pointer.is_null() {
            self.release_recursive(pointer);
            self.first_root.store_volatile(VolatilePointer::NULL);
        }
    }

    fn release_recursive(&self, pointer: VolatilePointer) {
        let page = self.resolve_page(pointer);
        if page.version().get().has_foster_child() {
            self.release_recursive(page.foster_child());
        }
        if page.is_border() {
            let border = page.as_border();
            let count = page.version().get().key_count();
            for index in 0..count {
                // A moved layer-pointer slot has a live copy in the foster
                // sibling; releasing through both would double-free.
                if border.does_point_to_layer(index)
                    && !border.owner_id(index).load_acquire().is_moved()
                {
                    self.release_recursive(border.next_layer_pointer(index).volatile());
                }
            }
        } else {
            let intermediate = page.as_intermediate();
            let minipage_count = page.version().get().key_count() + 1;
            for mini_index in 0..minipage_count {
                let minipage = intermediate.minipage(mini_index);
                let pointer_count = minipage.version().get().key_count() + 1;
                for pointer_index in 0..pointer_count {
                    let child = minipage.pointer(pointer_index).volatile();
                    if !child.is_null() {
                        self.release_recursive(child);
                    }
                }
            }
        }
        self.resolver
            .pool(pointer.node())
            .release(pointer.offset());
    }
}
